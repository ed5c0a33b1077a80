use thiserror::Error;

use crate::service::TemplateType;

/// Failure classes a registry transport reports. The protocol treats
/// `AlreadyExists` as success and `Aborted`/`NotFound` as "needs creating".
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("registry transport error: {0}")]
    Transport(String),
}

impl ServiceError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ServiceError::AlreadyExists(_))
    }

    /// The version or build being asked for does not exist yet.
    pub fn is_missing(&self) -> bool {
        matches!(self, ServiceError::Aborted(_) | ServiceError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("failed to create client connection to artifact registry: {0}")]
    Connect(String),

    #[error("build is already done")]
    BuildAlreadyDone { name: String },

    #[error("no registry compatible artifacts were found for the build {name:?}")]
    NotRegistryArtifact { name: String },

    #[error("no build found for component {0:?}")]
    UnknownBuild(String),

    #[error("component {0:?} is already registered for this version")]
    DuplicateComponent(String),

    #[error("the build for the component {0:?} does not have a valid id")]
    MissingBuildId(String),

    #[error("do not use update_build_status for updating to DONE")]
    DoneViaStatusUpdate,

    #[error("cannot modify status of DONE build {0}")]
    BuildIsDone(String),

    #[error("setting a build to DONE with no published images is not currently supported.")]
    NoImages,

    #[error("failed to add image to build {name:?}: {reason}")]
    InvalidImage { name: String, reason: String },

    #[error("template type should not be unset when creating a version")]
    UnsetTemplateType,

    #[error("This version was initially created with a {existing} template. Changing from {existing} to {requested} is not supported.")]
    TemplateTypeMismatch { existing: TemplateType, requested: TemplateType },

    #[error(
        "The version associated to the fingerprint {fingerprint} is complete. If you wish to add a new build to this \
         bucket a new version must be created by changing the build fingerprint."
    )]
    VersionComplete { fingerprint: String },

    #[error("failed to initialize bucket {bucket:?}: {source}")]
    BucketInit { bucket: String, source: ServiceError },

    #[error("failed to initialize version for fingerprint {fingerprint}: {source}")]
    VersionInit { fingerprint: String, source: ServiceError },

    #[error("error listing builds for this existing version: {0}")]
    ListBuilds(ServiceError),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<RegistryError>),

    #[error("build failed, not uploading artifacts")]
    BuildFailed,

    #[error("failed to update registry status for {name:?}: {source}")]
    StatusUpdate { name: String, source: Box<RegistryError> },

    #[error("failed to update registry with image artifacts for {name:?}: {source}")]
    PublishImages { name: String, source: Box<RegistryError> },
}

impl RegistryError {
    pub fn is_build_already_done(&self) -> bool {
        matches!(self, RegistryError::BuildAlreadyDone { .. })
    }

    pub fn is_not_registry_artifact(&self) -> bool {
        matches!(self, RegistryError::NotRegistryArtifact { .. })
    }
}

fn join_errors(errs: &[RegistryError]) -> String {
    let mut out = format!("{} error(s) occurred:", errs.len());
    for e in errs {
        out.push_str("\n\t* ");
        out.push_str(&e.to_string());
    }
    out
}
