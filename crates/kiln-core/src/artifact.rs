use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// State key under which an artifact publishes the images it produced, in the
/// shape the registry understands (a list of [`RegistryImage`]).
pub const REGISTRY_IMAGES_STATE: &str = "kiln.registry.images";

/// Something a builder or post-processor produced.
pub trait Artifact: Send + Sync + fmt::Debug {
    fn builder_id(&self) -> &str;
    fn id(&self) -> String;
    fn files(&self) -> Vec<String>;
    /// Human readable description, used in the end-of-run summary.
    fn string(&self) -> String;
    /// Extra typed state keyed by name.
    fn state(&self, name: &str) -> Option<serde_json::Value>;
    /// Removes whatever the artifact points at. Called for intermediate artifacts
    /// a post-processor chain does not keep.
    fn destroy(&self) -> anyhow::Result<()>;
}

pub type ArtifactRef = Arc<dyn Artifact>;

/// One image as recorded by the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryImage {
    pub image_id: String,
    pub provider_name: String,
    #[serde(default)]
    pub provider_region: String,
    #[serde(default)]
    pub source_image_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl RegistryImage {
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.provider_name, self.provider_region, self.image_id)
    }
}

/// General purpose artifact used by the built-in components.
#[derive(Clone, Debug, Default)]
pub struct BasicArtifact {
    pub builder_id: String,
    pub id: String,
    pub files: Vec<String>,
    pub description: String,
    pub state: BTreeMap<String, serde_json::Value>,
}

impl BasicArtifact {
    pub fn new(builder_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self { builder_id: builder_id.into(), id: id.into(), ..Default::default() }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_images(mut self, images: &[RegistryImage]) -> Self {
        self.state.insert(REGISTRY_IMAGES_STATE.to_string(), serde_json::to_value(images).unwrap_or_default());
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }
}

impl Artifact for BasicArtifact {
    fn builder_id(&self) -> &str {
        &self.builder_id
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn files(&self) -> Vec<String> {
        self.files.clone()
    }

    fn string(&self) -> String {
        if self.description.is_empty() {
            return format!("{} ({})", self.id, self.builder_id);
        }
        self.description.clone()
    }

    fn state(&self, name: &str) -> Option<serde_json::Value> {
        self.state.get(name).cloned()
    }

    fn destroy(&self) -> anyhow::Result<()> {
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(anyhow::anyhow!("remove {file}: {e}")),
            }
        }
        Ok(())
    }
}
