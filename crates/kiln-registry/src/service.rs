use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kiln_core::{BuildId, RegistryImage, RunUuid, VersionId};
use serde::{Deserialize, Serialize};

use crate::build::BuildStatus;
use crate::error::ServiceError;

/// Which configuration format created a version. Fixed after first use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateType {
    #[default]
    Unset,
    Block,
    Legacy,
}

impl TemplateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateType::Unset => "UNSET",
            TemplateType::Block => "BLOCK",
            TemplateType::Legacy => "LEGACY",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "BLOCK" => TemplateType::Block,
            "LEGACY" => TemplateType::Legacy,
            _ => TemplateType::Unset,
        }
    }
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteVersion {
    pub id: VersionId,
    pub bucket_name: String,
    pub fingerprint: String,
    pub template_type: TemplateType,
    pub complete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteBuild {
    pub id: BuildId,
    pub version_id: VersionId,
    pub component_type: String,
    pub run_uuid: RunUuid,
    pub status: BuildStatus,
    pub cloud_provider: String,
    pub labels: BTreeMap<String, String>,
    pub images: Vec<RegistryImage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateBuild {
    pub bucket_name: String,
    pub version_id: VersionId,
    pub fingerprint: String,
    pub run_uuid: RunUuid,
    pub component_type: String,
    pub status: BuildStatus,
}

/// Partial update of a build. `None` leaves the remote value untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildUpdate {
    pub build_id: BuildId,
    pub run_uuid: RunUuid,
    pub status: BuildStatus,
    pub cloud_provider: Option<String>,
    pub source_image_id: Option<String>,
    pub source_version_id: Option<String>,
    pub source_channel_id: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub images: Option<Vec<RegistryImage>>,
}

impl BuildUpdate {
    pub fn status(build_id: BuildId, run_uuid: RunUuid, status: BuildStatus) -> Self {
        Self { build_id, run_uuid, status, ..Default::default() }
    }
}

/// Logical operations the registry protocol needs from a remote service.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait RegistryService: Send + Sync {
    /// `organization/project` the service writes to.
    fn destination(&self) -> String;

    async fn create_bucket(&self, name: &str, description: &str, labels: &BTreeMap<String, String>) -> Result<(), ServiceError>;
    async fn update_bucket(&self, name: &str, description: &str, labels: &BTreeMap<String, String>) -> Result<(), ServiceError>;

    async fn create_version(&self, bucket: &str, fingerprint: &str, template_type: TemplateType) -> Result<RemoteVersion, ServiceError>;
    async fn get_version(&self, bucket: &str, fingerprint: &str) -> Result<RemoteVersion, ServiceError>;

    async fn create_build(&self, req: CreateBuild) -> Result<RemoteBuild, ServiceError>;
    async fn update_build(&self, update: BuildUpdate) -> Result<RemoteBuild, ServiceError>;
    async fn list_builds(&self, bucket: &str, version_id: &VersionId) -> Result<Vec<RemoteBuild>, ServiceError>;
}

/// Creates the bucket, falling back to an update when it already exists.
pub async fn upsert_bucket(
    service: &dyn RegistryService,
    name: &str,
    description: &str,
    labels: &BTreeMap<String, String>,
) -> Result<(), ServiceError> {
    match service.create_bucket(name, description, labels).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            tracing::debug!(bucket = name, "bucket already exists, updating");
            service.update_bucket(name, description, labels).await
        }
        Err(e) => Err(e),
    }
}
