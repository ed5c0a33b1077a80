#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kiln_config::{load_handler, ConfigHandler, VarInputs};
use kiln_core::{
    ArtifactRef, BasicArtifact, Builder, BuilderVariables, CancelToken, ConfigValue, Datasource, GeneratedData, PluginContext,
    PluginStore, PostProcessed, PostProcessor, Prepared, ProvisionHook, Provisioner, SecretFilter, SharedUi,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, line: impl Into<String>) {
        self.0.lock().unwrap().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn flag(config: &Value, key: &str) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn text(config: &Value, key: &str) -> String {
    config.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

pub struct FakeBuilder {
    log: Log,
    config: Value,
}

#[async_trait]
impl Builder for FakeBuilder {
    fn prepare(&mut self, _vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<Prepared> {
        if flag(config, "invalid") {
            anyhow::bail!("invalid is set");
        }
        self.config = config.clone();
        Ok(Prepared { generated_vars: vec!["Region".to_string()], warnings: Vec::new() })
    }

    async fn run(&self, cancel: &CancelToken, ui: &SharedUi, hook: &dyn ProvisionHook) -> anyhow::Result<Option<ArtifactRef>> {
        let id = text(&self.config, "id");
        self.log.push(format!("build {id}"));
        let data = GeneratedData::from([("ID".to_string(), json!(format!("i-{id}"))), ("Region".to_string(), json!("eu"))]);
        hook.provision(cancel, ui, &data).await?;
        if flag(&self.config, "no_artifact") {
            return Ok(None);
        }
        let mut artifact = BasicArtifact::new("fake", id);
        let file = text(&self.config, "file");
        if !file.is_empty() {
            artifact = artifact.with_files(vec![file]);
        }
        Ok(Some(Arc::new(artifact)))
    }
}

pub struct RecordProvisioner {
    log: Log,
    config: Value,
}

#[async_trait]
impl Provisioner for RecordProvisioner {
    fn prepare(&mut self, _vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        self.config = config.clone();
        Ok(())
    }

    async fn provision(&self, _cancel: &CancelToken, _ui: &SharedUi, _data: &GeneratedData) -> anyhow::Result<()> {
        self.log.push(format!("provision {}", text(&self.config, "msg")));
        if flag(&self.config, "fail") {
            anyhow::bail!("{} failed", text(&self.config, "msg"));
        }
        Ok(())
    }
}

pub struct WrapPostProcessor {
    log: Log,
    config: Value,
}

#[async_trait]
impl PostProcessor for WrapPostProcessor {
    fn configure(&mut self, _vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        self.config = config.clone();
        Ok(())
    }

    async fn post_process(&self, _cancel: &CancelToken, _ui: &SharedUi, input: ArtifactRef) -> anyhow::Result<PostProcessed> {
        self.log.push(format!("wrap {}", input.id()));
        if flag(&self.config, "fail") {
            anyhow::bail!("wrap refused {}", input.id());
        }
        Ok(PostProcessed {
            artifact: Arc::new(BasicArtifact::new("fake.wrap", format!("wrapped-{}", input.id()))),
            keep_input: flag(&self.config, "keep"),
            force_keep: flag(&self.config, "force"),
        })
    }
}

pub struct EchoDatasource {
    executions: Arc<AtomicUsize>,
    config: Value,
}

impl Datasource for EchoDatasource {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()> {
        if config.get("value").is_none() {
            anyhow::bail!("value is required");
        }
        self.config = config.clone();
        Ok(())
    }

    fn output_spec(&self) -> ConfigValue {
        json!({"value": ""})
    }

    fn execute(&self) -> anyhow::Result<ConfigValue> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"value": self.config["value"].clone()}))
    }
}

pub struct IdentityDatasource {
    config: Value,
}

impl Datasource for IdentityDatasource {
    fn configure(&mut self, config: &ConfigValue) -> anyhow::Result<()> {
        self.config = config.clone();
        Ok(())
    }

    fn output_spec(&self) -> ConfigValue {
        json!({"id": "", "version_id": "", "channel_id": ""})
    }

    fn execute(&self) -> anyhow::Result<ConfigValue> {
        Ok(self.config.clone())
    }
}

#[derive(Default)]
pub struct Fakes {
    pub log: Log,
    pub executions: Arc<AtomicUsize>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> PluginStore {
        let mut store = PluginStore::default();
        let log = self.log.clone();
        store.builders.register("fake", move || Box::new(FakeBuilder { log: log.clone(), config: Value::Null }));
        let log = self.log.clone();
        store.provisioners.register("record", move || Box::new(RecordProvisioner { log: log.clone(), config: Value::Null }));
        let log = self.log.clone();
        store.post_processors.register("wrap", move || Box::new(WrapPostProcessor { log: log.clone(), config: Value::Null }));
        let executions = self.executions.clone();
        store.datasources.register("echo", move || Box::new(EchoDatasource { executions: executions.clone(), config: Value::Null }));
        for kind in ["registry-image", "registry-version"] {
            store.datasources.register(kind, || Box::new(IdentityDatasource { config: Value::Null }));
        }
        store
    }

    pub fn context(&self) -> PluginContext {
        PluginContext::new(self.store(), Arc::new(SecretFilter::new()))
    }

    pub fn load(&self, path: &Path) -> Box<dyn ConfigHandler> {
        self.load_with(path, &VarInputs::default())
    }

    pub fn load_with(&self, path: &Path, inputs: &VarInputs) -> Box<dyn ConfigHandler> {
        let (mut handler, diags) = load_handler(path, self.context(), inputs).unwrap();
        assert!(!diags.has_errors(), "{diags:?}");
        let diags = handler.evaluate_datasources(false);
        assert!(!diags.has_errors(), "{diags:?}");
        let diags = handler.evaluate_variables();
        assert!(!diags.has_errors(), "{diags:?}");
        let diags = handler.evaluate_builds();
        assert!(!diags.has_errors(), "{diags:?}");
        handler
    }
}

pub fn write_template(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}
