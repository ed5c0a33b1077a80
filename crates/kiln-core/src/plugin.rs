use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{ArtifactRef, CancelToken, SecretFilter, SharedUi};

/// Decoded configuration body handed to a component.
pub type ConfigValue = serde_json::Value;

/// Build variables: core version, debug/force/on-error flags
/// plus the source's own `name`/`type`.
pub type BuilderVariables = BTreeMap<String, String>;

/// Values a builder generates at run time and passes to its provisioners.
pub type GeneratedData = BTreeMap<String, serde_json::Value>;

pub const BUILD_NAME_VAR: &str = "kiln_build_name";
pub const BUILDER_TYPE_VAR: &str = "kiln_builder_type";
pub const CORE_VERSION_VAR: &str = "kiln_core_version";
pub const DEBUG_VAR: &str = "kiln_debug";
pub const FORCE_VAR: &str = "kiln_force";
pub const ON_ERROR_VAR: &str = "kiln_on_error";

/// Placeholder for values that are only known once a build runs.
pub const UNKNOWN_VALUE: &str = "<unknown>";

/// Keys every builder exposes to provisioners.
pub const BUILDER_DATA_COMMON_KEYS: [&str; 7] = ["ID", "Host", "Port", "User", "Password", "ConnType", "KilnRunUUID"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Prepared {
    pub generated_vars: Vec<String>,
    pub warnings: Vec<String>,
}

/// Runs the provisioners of a build from inside the builder.
#[async_trait]
pub trait ProvisionHook: Send + Sync {
    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Builder: Send + Sync {
    fn prepare(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<Prepared>;

    /// Produces at most one artifact. The builder is expected to call `hook`
    /// once its machine is reachable.
    async fn run(&self, cancel: &CancelToken, ui: &SharedUi, hook: &dyn ProvisionHook) -> anyhow::Result<Option<ArtifactRef>>;
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn prepare(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()>;

    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()>;
}

pub struct PostProcessed {
    pub artifact: ArtifactRef,
    /// Whether the input artifact is kept when the template does not say.
    pub keep_input: bool,
    /// Overrides `keep_input_artifact` from the template.
    pub force_keep: bool,
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn configure(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()>;

    async fn post_process(&self, cancel: &CancelToken, ui: &SharedUi, input: ArtifactRef) -> anyhow::Result<PostProcessed>;
}

/// Configuration-time value producer.
pub trait Datasource: Send + Sync {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()>;
    /// Shape of the value `execute` returns; used to build placeholders
    /// when execution is skipped.
    fn output_spec(&self) -> ConfigValue;
    fn execute(&self) -> anyhow::Result<ConfigValue>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("unknown {kind} type {name:?}; known: {known:?}")]
    Unknown { kind: &'static str, name: String, known: Vec<String> },
}

type Factory<T> = Arc<dyn Fn() -> Box<T> + Send + Sync>;

/// Named factories for one kind of component.
pub struct ComponentSet<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> ComponentSet<T> {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, factories: BTreeMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: impl Fn() -> Box<T> + Send + Sync + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn start(&self, name: &str) -> Result<Box<T>, PluginError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(PluginError::Unknown { kind: self.kind, name: name.to_string(), known: self.list() }),
        }
    }
}

impl<T: ?Sized> Clone for ComponentSet<T> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, factories: self.factories.clone() }
    }
}

#[derive(Clone)]
pub struct PluginStore {
    pub builders: ComponentSet<dyn Builder>,
    pub provisioners: ComponentSet<dyn Provisioner>,
    pub post_processors: ComponentSet<dyn PostProcessor>,
    pub datasources: ComponentSet<dyn Datasource>,
}

impl Default for PluginStore {
    fn default() -> Self {
        Self {
            builders: ComponentSet::new("builder"),
            provisioners: ComponentSet::new("provisioner"),
            post_processors: ComponentSet::new("post-processor"),
            datasources: ComponentSet::new("data source"),
        }
    }
}

/// Everything a configuration handler needs from its surroundings. Built once
/// per run and passed down explicitly.
#[derive(Clone)]
pub struct PluginContext {
    pub plugins: Arc<PluginStore>,
    pub secrets: Arc<SecretFilter>,
    pub core_version: String,
}

impl PluginContext {
    pub fn new(plugins: PluginStore, secrets: Arc<SecretFilter>) -> Self {
        Self { plugins: Arc::new(plugins), secrets, core_version: env!("CARGO_PKG_VERSION").to_string() }
    }
}
