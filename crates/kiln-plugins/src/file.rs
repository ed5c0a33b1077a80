use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use kiln_core::{
    ArtifactRef, BasicArtifact, Builder, BuilderVariables, CancelToken, ConfigValue, GeneratedData, Prepared, ProvisionHook,
    RegistryImage, SharedUi,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

pub const BUILDER_ID: &str = "kiln.file";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Copied to `target` instead of writing `content`.
    #[serde(default)]
    pub source: Option<String>,
}

/// Writes a single file and reports it as an image, so file builds can be
/// tracked by the registry.
#[derive(Default)]
pub struct FileBuilder {
    config: FileConfig,
}

#[async_trait]
impl Builder for FileBuilder {
    fn prepare(&mut self, _vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<Prepared> {
        let parsed: FileConfig = crate::decode("file builder", config)?;
        if parsed.target.is_empty() {
            anyhow::bail!("target for file builder is required");
        }
        let mut warnings = Vec::new();
        match (&parsed.source, &parsed.content) {
            (Some(_), Some(_)) => anyhow::bail!("source and content cannot both be specified"),
            (None, None) => warnings.push("Both source file and contents are blank; target will have no content".to_string()),
            (Some(source), None) if !Path::new(source).exists() => anyhow::bail!("Unable to read source file: {source}"),
            _ => {}
        }
        self.config = parsed;
        Ok(Prepared { generated_vars: vec!["Checksum".to_string()], warnings })
    }

    async fn run(&self, cancel: &CancelToken, ui: &SharedUi, hook: &dyn ProvisionHook) -> anyhow::Result<Option<ArtifactRef>> {
        let target = &self.config.target;
        if cancel.is_cancelled() {
            anyhow::bail!("build cancelled before writing {target}");
        }
        if let Some(parent) = Path::new(target).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("create {}", parent.display()))?;
        }

        match &self.config.source {
            Some(source) => {
                ui.say(&format!("Copying {source} to {target}"));
                tokio::fs::copy(source, target).await.with_context(|| format!("copy {source} to {target}"))?;
            }
            None => {
                ui.say(&format!("Writing contents to {target}"));
                let content = self.config.content.as_deref().unwrap_or_default();
                tokio::fs::write(target, content).await.with_context(|| format!("write {target}"))?;
            }
        }

        let bytes = tokio::fs::read(target).await.with_context(|| format!("read {target}"))?;
        let checksum = hex::encode(Sha256::digest(&bytes));
        let data = GeneratedData::from([("ID".to_string(), json!(target)), ("Checksum".to_string(), json!(checksum))]);
        hook.provision(cancel, ui, &data).await?;

        let image = RegistryImage {
            image_id: format!("sha256:{checksum}"),
            provider_name: "file".to_string(),
            provider_region: "local".to_string(),
            ..Default::default()
        };
        let artifact = BasicArtifact::new(BUILDER_ID, target.clone())
            .with_files(vec![target.clone()])
            .with_description(format!("Stored file: {target}"))
            .with_images(&[image]);
        Ok(Some(Arc::new(artifact)))
    }
}
