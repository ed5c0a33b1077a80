use kiln_core::{ConfigValue, Datasource};
use serde_json::json;

/// Returns its `value` setting unchanged as `{ value = ... }`.
#[derive(Default)]
pub struct StaticDatasource {
    value: ConfigValue,
}

impl Datasource for StaticDatasource {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()> {
        match config.get("value") {
            Some(value) => {
                self.value = value.clone();
                Ok(())
            }
            None => anyhow::bail!("value is required"),
        }
    }

    fn output_spec(&self) -> ConfigValue {
        json!({ "value": self.value })
    }

    fn execute(&self) -> anyhow::Result<ConfigValue> {
        Ok(json!({ "value": self.value }))
    }
}
