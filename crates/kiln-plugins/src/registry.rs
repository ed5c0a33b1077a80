//! Data sources reading what earlier runs published to the local registry.

use std::collections::BTreeMap;

use anyhow::Context;
use kiln_core::{ConfigValue, Datasource};
use kiln_registry_sqlite::{database_path, SqliteService};
use serde::Deserialize;
use serde_json::json;

pub const IMAGE_DATASOURCE: &str = "registry-image";
pub const VERSION_DATASOURCE: &str = "registry-version";

/// The only channel the local registry serves: the newest complete version.
pub const LATEST_CHANNEL: &str = "latest";

fn open(database: &Option<String>) -> anyhow::Result<SqliteService> {
    let from_env = std::env::var("KILN_REGISTRY_DB").ok();
    let path = database_path(database.as_deref().or(from_env.as_deref()));
    SqliteService::open(&path).with_context(|| format!("open local registry {}", path.display()))
}

fn check_channel(channel: &str) -> anyhow::Result<()> {
    if channel != LATEST_CHANNEL {
        anyhow::bail!("unknown channel {channel:?}; the local registry only serves {LATEST_CHANNEL:?}");
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    pub bucket_name: String,
    /// Picks an exact version instead of the channel.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

/// `registry-version`: id and fingerprint of a published version.
#[derive(Default)]
pub struct RegistryVersionDatasource {
    query: VersionQuery,
}

impl RegistryVersionDatasource {
    pub fn lookup(&self, service: &SqliteService) -> anyhow::Result<ConfigValue> {
        let q = &self.query;
        let (version, channel_id) = match &q.fingerprint {
            Some(fingerprint) => (service.version_by_fingerprint(&q.bucket_name, fingerprint)?, String::new()),
            None => (service.latest_complete_version(&q.bucket_name)?, LATEST_CHANNEL.to_string()),
        };
        let version = version.ok_or_else(|| anyhow::anyhow!("no matching version found in bucket {:?}", q.bucket_name))?;
        Ok(json!({
            "id": version.id.as_str(),
            "bucket_name": version.bucket_name,
            "fingerprint": version.fingerprint,
            "channel_id": channel_id,
            "complete": version.complete,
        }))
    }
}

impl Datasource for RegistryVersionDatasource {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()> {
        let query: VersionQuery = crate::decode("registry-version", config)?;
        if query.bucket_name.is_empty() {
            anyhow::bail!("bucket_name is required");
        }
        if query.fingerprint.is_some() && query.channel.is_some() {
            anyhow::bail!("fingerprint and channel cannot both be set");
        }
        check_channel(query.channel.as_deref().unwrap_or(LATEST_CHANNEL))?;
        self.query = query;
        Ok(())
    }

    fn output_spec(&self) -> ConfigValue {
        json!({"id": "", "bucket_name": "", "fingerprint": "", "channel_id": "", "complete": false})
    }

    fn execute(&self) -> anyhow::Result<ConfigValue> {
        self.lookup(&open(&self.query.database)?)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageQuery {
    #[serde(default)]
    pub bucket_name: String,
    /// Exact version; the latest complete one when unset.
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub component_type: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

/// `registry-image`: one image published by a version, usable as the source
/// of a later build.
#[derive(Default)]
pub struct RegistryImageDatasource {
    query: ImageQuery,
}

impl RegistryImageDatasource {
    pub fn lookup(&self, service: &SqliteService) -> anyhow::Result<ConfigValue> {
        let q = &self.query;
        let (version, channel_id) = match &q.version_id {
            Some(id) => (service.version_by_id(id)?, String::new()),
            None => (service.latest_complete_version(&q.bucket_name)?, LATEST_CHANNEL.to_string()),
        };
        let version = version
            .filter(|v| v.bucket_name == q.bucket_name)
            .ok_or_else(|| anyhow::anyhow!("no matching version found in bucket {:?}", q.bucket_name))?;

        let matches = |wanted: &Option<String>, actual: &str| wanted.as_deref().map_or(true, |w| w == actual);
        let found = service.published_images(&version.id)?.into_iter().find(|p| {
            matches(&q.component_type, &p.component_type)
                && matches(&q.provider, &p.image.provider_name)
                && matches(&q.region, &p.image.provider_region)
        });
        let Some(published) = found else {
            anyhow::bail!(
                "no image found matching provider {:?} and region {:?} in version {}",
                q.provider.as_deref().unwrap_or("*"),
                q.region.as_deref().unwrap_or("*"),
                version.id
            );
        };

        let image = published.image;
        Ok(json!({
            "id": image.image_id,
            "version_id": version.id.as_str(),
            "channel_id": channel_id,
            "component_type": published.component_type,
            "provider": image.provider_name,
            "region": image.provider_region,
            "labels": image.labels,
        }))
    }
}

impl Datasource for RegistryImageDatasource {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()> {
        let query: ImageQuery = crate::decode("registry-image", config)?;
        if query.bucket_name.is_empty() {
            anyhow::bail!("bucket_name is required");
        }
        self.query = query;
        Ok(())
    }

    fn output_spec(&self) -> ConfigValue {
        json!({
            "id": "",
            "version_id": "",
            "channel_id": "",
            "component_type": "",
            "provider": "",
            "region": "",
            "labels": BTreeMap::<String, String>::new(),
        })
    }

    fn execute(&self) -> anyhow::Result<ConfigValue> {
        self.lookup(&open(&self.query.database)?)
    }
}
