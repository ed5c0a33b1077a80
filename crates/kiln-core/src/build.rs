use async_trait::async_trait;

use crate::{ArtifactRef, CancelToken, SharedUi};

/// A fully prepared unit of work the scheduler can run exactly once.
#[async_trait]
pub trait BuildUnit: Send + Sync {
    /// Component name, e.g. `docker.ubuntu` or `web.docker.ubuntu`.
    fn name(&self) -> String;

    async fn run(&self, cancel: &CancelToken, ui: SharedUi) -> anyhow::Result<Vec<ArtifactRef>>;
}
