use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{
    ArtifactRef, BasicArtifact, Builder, BuilderVariables, CancelToken, ConfigValue, GeneratedData, Prepared, ProvisionHook,
    RegistryImage, SharedUi, BUILD_NAME_VAR,
};
use serde::Deserialize;
use serde_json::json;

pub const BUILDER_ID: &str = "kiln.null";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NullConfig {
    /// Artifact id; defaults to the build name.
    #[serde(default)]
    pub id: String,
    /// Images to report as if the build had produced them.
    #[serde(default)]
    pub images: Vec<RegistryImage>,
}

/// Builder that creates nothing. It runs the provisioners against the local
/// machine and returns an artifact carrying the configured images.
#[derive(Default)]
pub struct NullBuilder {
    config: NullConfig,
}

#[async_trait]
impl Builder for NullBuilder {
    fn prepare(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<Prepared> {
        let mut parsed: NullConfig = crate::decode("null builder", config)?;
        if parsed.id.is_empty() {
            parsed.id = vars.get(BUILD_NAME_VAR).cloned().unwrap_or_else(|| "null".to_string());
        }
        for (i, image) in parsed.images.iter().enumerate() {
            if image.image_id.is_empty() || image.provider_name.is_empty() {
                anyhow::bail!("images[{i}]: image_id and provider_name are required");
            }
        }
        self.config = parsed;
        Ok(Prepared::default())
    }

    async fn run(&self, cancel: &CancelToken, ui: &SharedUi, hook: &dyn ProvisionHook) -> anyhow::Result<Option<ArtifactRef>> {
        let data = GeneratedData::from([
            ("ID".to_string(), json!(self.config.id)),
            ("Host".to_string(), json!("127.0.0.1")),
            ("ConnType".to_string(), json!("none")),
        ]);
        hook.provision(cancel, ui, &data).await?;

        let mut artifact = BasicArtifact::new(BUILDER_ID, self.config.id.clone()).with_description(format!("Null artifact {}", self.config.id));
        if !self.config.images.is_empty() {
            artifact = artifact.with_images(&self.config.images);
        }
        Ok(Some(Arc::new(artifact)))
    }
}
