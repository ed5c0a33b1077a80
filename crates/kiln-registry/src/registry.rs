use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{ArtifactRef, CancelToken, SharedUi};

use crate::bucket::Bucket;
use crate::error::RegistryError;
use crate::service::TemplateType;

/// Lifecycle hooks the scheduler calls around every build. Callers invoke
/// them unconditionally; [`NullRegistry`] stands in when sync is off.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn populate_version(&self) -> Result<(), RegistryError>;

    async fn start_build(&self, cancel: &CancelToken, name: &str) -> Result<(), RegistryError>;

    async fn complete_build(
        &self,
        cancel: &CancelToken,
        name: &str,
        artifacts: Vec<ArtifactRef>,
        run_err: Option<&anyhow::Error>,
    ) -> (Vec<ArtifactRef>, Result<(), RegistryError>);

    fn version_status_summary(&self, ui: &SharedUi);
}

/// Registry used when sync is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRegistry;

#[async_trait]
impl Registry for NullRegistry {
    async fn populate_version(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn start_build(&self, _cancel: &CancelToken, _name: &str) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn complete_build(
        &self,
        _cancel: &CancelToken,
        _name: &str,
        artifacts: Vec<ArtifactRef>,
        _run_err: Option<&anyhow::Error>,
    ) -> (Vec<ArtifactRef>, Result<(), RegistryError>) {
        (artifacts, Ok(()))
    }

    fn version_status_summary(&self, _ui: &SharedUi) {}
}

/// Registry backed by a [`Bucket`].
pub struct BucketRegistry {
    bucket: Arc<Bucket>,
    template_type: TemplateType,
    ui: SharedUi,
}

impl BucketRegistry {
    pub fn new(bucket: Bucket, template_type: TemplateType, ui: SharedUi) -> Self {
        Self { bucket: Arc::new(bucket), template_type, ui }
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    fn run_metadata() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("kiln_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("os".to_string(), std::env::consts::OS.to_string()),
            ("arch".to_string(), std::env::consts::ARCH.to_string()),
        ])
    }
}

#[async_trait]
impl Registry for BucketRegistry {
    async fn populate_version(&self) -> Result<(), RegistryError> {
        self.bucket.initialize(self.template_type).await?;
        self.bucket.populate_version().await?;

        let metadata = Self::run_metadata();
        for name in self.bucket.version.expected_builds() {
            if self.bucket.version.has_build(name) {
                self.bucket.version.add_metadata_to_build(name, &metadata)?;
            }
        }

        self.ui.say(&format!("Tracking build on the kiln registry with fingerprint {:?}", self.bucket.version.fingerprint));
        Ok(())
    }

    async fn start_build(&self, cancel: &CancelToken, name: &str) -> Result<(), RegistryError> {
        self.bucket.start_build(cancel, name).await
    }

    async fn complete_build(
        &self,
        cancel: &CancelToken,
        name: &str,
        artifacts: Vec<ArtifactRef>,
        run_err: Option<&anyhow::Error>,
    ) -> (Vec<ArtifactRef>, Result<(), RegistryError>) {
        self.bucket.complete_build(cancel, name, artifacts, run_err).await
    }

    fn version_status_summary(&self, ui: &SharedUi) {
        let version = &self.bucket.version;
        let mut out = format!(
            "\n==> Kiln registry version summary\n    bucket: {}\n    version: {}\n    fingerprint: {}",
            self.bucket.name,
            version.id(),
            version.fingerprint,
        );
        let destination = self.bucket.destination();
        if !destination.is_empty() {
            out.push_str(&format!("\n    destination: {destination}"));
        }
        for (name, build) in version.builds() {
            out.push_str(&format!("\n    {name}: {}", build.status));
            if !build.images.is_empty() {
                out.push_str(&format!(" ({} image(s))", build.images.len()));
            }
        }
        ui.say(&out);
    }
}
