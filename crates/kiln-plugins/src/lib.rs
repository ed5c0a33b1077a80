//! Components that ship with kiln.

pub mod breakpoint;
pub mod checksum;
pub mod env;
pub mod file;
pub mod manifest;
pub mod null;
pub mod registry;
pub mod shell_local;
pub mod static_value;

use anyhow::Context;
use kiln_core::{ConfigValue, PluginStore};
use serde::de::DeserializeOwned;

pub use breakpoint::BreakpointProvisioner;
pub use checksum::ChecksumPostProcessor;
pub use env::EnvDatasource;
pub use file::FileBuilder;
pub use manifest::ManifestPostProcessor;
pub use null::NullBuilder;
pub use registry::{RegistryImageDatasource, RegistryVersionDatasource};
pub use shell_local::ShellLocalProvisioner;
pub use static_value::StaticDatasource;

/// Adds every built-in component to `store`.
pub fn register_builtin(store: &mut PluginStore) {
    store.builders.register("null", || Box::<NullBuilder>::default());
    store.builders.register("file", || Box::<FileBuilder>::default());

    store.provisioners.register("shell-local", || Box::<ShellLocalProvisioner>::default());
    store.provisioners.register("breakpoint", || Box::<BreakpointProvisioner>::default());

    store.post_processors.register("manifest", || Box::<ManifestPostProcessor>::default());
    store.post_processors.register("checksum", || Box::<ChecksumPostProcessor>::default());

    store.datasources.register("static", || Box::<StaticDatasource>::default());
    store.datasources.register("env", || Box::<EnvDatasource>::default());
    store.datasources.register(registry::IMAGE_DATASOURCE, || Box::<RegistryImageDatasource>::default());
    store.datasources.register(registry::VERSION_DATASOURCE, || Box::<RegistryVersionDatasource>::default());
}

/// A store holding only the built-in components.
pub fn builtin_store() -> PluginStore {
    let mut store = PluginStore::default();
    register_builtin(&mut store);
    store
}

/// Decodes a component's configuration body into its typed settings.
pub(crate) fn decode<T: DeserializeOwned>(component: &str, config: &ConfigValue) -> anyhow::Result<T> {
    let config = if config.is_null() { serde_json::json!({}) } else { config.clone() };
    serde_json::from_value(config).with_context(|| format!("invalid {component} configuration"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_store_lists_every_component() {
        let store = builtin_store();
        assert_eq!(store.builders.list(), vec!["file", "null"]);
        assert_eq!(store.provisioners.list(), vec!["breakpoint", "shell-local"]);
        assert_eq!(store.post_processors.list(), vec!["checksum", "manifest"]);
        assert_eq!(store.datasources.list(), vec!["env", "registry-image", "registry-version", "static"]);
    }

    #[test]
    fn decode_names_the_component() {
        #[derive(serde::Deserialize, Debug)]
        struct Settings {
            #[allow(dead_code)]
            count: u32,
        }
        let err = decode::<Settings>("counter", &serde_json::json!({"count": "many"})).unwrap_err();
        assert!(format!("{err:#}").starts_with("invalid counter configuration"), "{err:#}");
        assert!(decode::<Settings>("counter", &serde_json::Value::Null).is_err());
    }
}
