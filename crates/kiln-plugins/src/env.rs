use kiln_core::{ConfigValue, Datasource};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EnvConfig {
    #[serde(default)]
    pub name: String,
    /// Used when the variable is unset or empty.
    #[serde(default)]
    pub default: Option<String>,
}

/// Reads one environment variable at configuration time.
#[derive(Default)]
pub struct EnvDatasource {
    config: EnvConfig,
}

impl EnvDatasource {
    fn lookup(&self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<String> {
        match lookup(&self.config.name).filter(|v| !v.is_empty()) {
            Some(value) => Ok(value),
            None => self
                .config
                .default
                .clone()
                .ok_or_else(|| anyhow::anyhow!("environment variable {} is not set", self.config.name)),
        }
    }
}

impl Datasource for EnvDatasource {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()> {
        let parsed: EnvConfig = crate::decode("env data source", config)?;
        if parsed.name.is_empty() {
            anyhow::bail!("name is required");
        }
        self.config = parsed;
        Ok(())
    }

    fn output_spec(&self) -> ConfigValue {
        json!({ "value": "" })
    }

    fn execute(&self) -> anyhow::Result<ConfigValue> {
        let value = self.lookup(|key| std::env::var(key).ok())?;
        Ok(json!({ "value": value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datasource(config: ConfigValue) -> EnvDatasource {
        let mut ds = EnvDatasource::default();
        ds.configure(&config).unwrap();
        ds
    }

    #[test]
    fn set_value_wins_over_default() {
        let ds = datasource(json!({"name": "REGION", "default": "eu"}));
        assert_eq!(ds.lookup(|_| Some("us".into())).unwrap(), "us");
        assert_eq!(ds.lookup(|_| Some(String::new())).unwrap(), "eu");
        assert_eq!(ds.lookup(|_| None).unwrap(), "eu");
    }

    #[test]
    fn unset_without_default_fails() {
        let ds = datasource(json!({"name": "REGION"}));
        assert_eq!(ds.lookup(|_| None).unwrap_err().to_string(), "environment variable REGION is not set");
        assert!(EnvDatasource::default().configure(&json!({})).is_err());
    }
}
