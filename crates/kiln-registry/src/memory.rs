use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use kiln_core::{BuildId, RegistryImage, RunUuid, VersionId};

use crate::build::BuildStatus;
use crate::error::ServiceError;
use crate::service::{BuildUpdate, CreateBuild, RegistryService, RemoteBuild, RemoteVersion, TemplateType};

/// Scripted state and call tracking for [`MockService`].
#[derive(Clone, Debug, Default)]
pub struct MockState {
    pub bucket_already_exist: bool,
    pub version_already_exist: bool,
    pub version_completed: bool,
    pub build_already_done: bool,
    pub existing_template_type: TemplateType,
    pub existing_builds: Vec<String>,
    pub existing_build_labels: BTreeMap<String, String>,
    /// `create_build` fails with this error for the given component type.
    pub create_build_errors: BTreeMap<String, ServiceError>,

    pub create_bucket_called: bool,
    pub update_bucket_called: bool,
    pub create_version_called: bool,
    pub get_version_called: bool,
    pub create_build_called: bool,
    pub update_build_called: bool,
    pub list_builds_called: bool,

    pub updates: Vec<BuildUpdate>,
    created_builds: usize,
}

/// In-memory registry transport for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockService {
    state: Mutex<MockState>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(configure: impl FnOnce(&mut MockState)) -> Self {
        let mut state = MockState::default();
        configure(&mut state);
        Self { state: Mutex::new(state) }
    }

    pub fn state(&self) -> MockState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RegistryService for MockService {
    fn destination(&self) -> String {
        "mock-org/mock-project".to_string()
    }

    async fn create_bucket(&self, name: &str, _description: &str, _labels: &BTreeMap<String, String>) -> Result<(), ServiceError> {
        let mut s = self.lock();
        if s.bucket_already_exist {
            return Err(ServiceError::AlreadyExists(format!("bucket {name}")));
        }
        if name.is_empty() {
            return Err(ServiceError::InvalidArgument("no bucket name was passed in".into()));
        }
        s.create_bucket_called = true;
        Ok(())
    }

    async fn update_bucket(&self, _name: &str, _description: &str, _labels: &BTreeMap<String, String>) -> Result<(), ServiceError> {
        self.lock().update_bucket_called = true;
        Ok(())
    }

    async fn create_version(&self, bucket: &str, fingerprint: &str, template_type: TemplateType) -> Result<RemoteVersion, ServiceError> {
        let mut s = self.lock();
        if s.version_already_exist {
            return Err(ServiceError::AlreadyExists(format!("version {fingerprint}")));
        }
        if fingerprint.is_empty() {
            return Err(ServiceError::InvalidArgument("no valid fingerprint was passed in".into()));
        }
        s.create_version_called = true;
        Ok(RemoteVersion {
            id: VersionId::from_str("version-id"),
            bucket_name: bucket.to_string(),
            fingerprint: fingerprint.to_string(),
            template_type,
            complete: false,
        })
    }

    async fn get_version(&self, bucket: &str, fingerprint: &str) -> Result<RemoteVersion, ServiceError> {
        let mut s = self.lock();
        if !s.version_already_exist {
            return Err(ServiceError::Aborted(format!("no version for fingerprint {fingerprint}")));
        }
        if bucket.is_empty() || fingerprint.is_empty() {
            return Err(ServiceError::InvalidArgument("bucket name and fingerprint are required".into()));
        }
        s.get_version_called = true;
        Ok(RemoteVersion {
            id: VersionId::from_str("version-id"),
            bucket_name: bucket.to_string(),
            fingerprint: fingerprint.to_string(),
            template_type: s.existing_template_type,
            complete: s.version_completed,
        })
    }

    async fn create_build(&self, req: CreateBuild) -> Result<RemoteBuild, ServiceError> {
        let mut s = self.lock();
        if req.bucket_name.is_empty() || req.fingerprint.is_empty() {
            return Err(ServiceError::InvalidArgument("bucket name and fingerprint are required".into()));
        }
        if req.component_type.is_empty() {
            return Err(ServiceError::InvalidArgument("no build component type was passed in".into()));
        }
        s.create_build_called = true;
        if let Some(err) = s.create_build_errors.get(&req.component_type) {
            return Err(err.clone());
        }
        s.created_builds += 1;
        Ok(RemoteBuild {
            id: BuildId::from_str(format!("build-{}", s.created_builds)),
            version_id: req.version_id,
            component_type: req.component_type,
            run_uuid: req.run_uuid,
            status: BuildStatus::Unset,
            ..Default::default()
        })
    }

    async fn update_build(&self, update: BuildUpdate) -> Result<RemoteBuild, ServiceError> {
        let mut s = self.lock();
        if update.build_id.is_empty() {
            return Err(ServiceError::InvalidArgument("no valid build id was passed in".into()));
        }
        if update.status == BuildStatus::Unset {
            return Err(ServiceError::InvalidArgument("no build status was passed in".into()));
        }
        s.update_build_called = true;
        let build = RemoteBuild { id: update.build_id.clone(), status: update.status, ..Default::default() };
        s.updates.push(update);
        Ok(build)
    }

    async fn list_builds(&self, _bucket: &str, version_id: &VersionId) -> Result<Vec<RemoteBuild>, ServiceError> {
        let mut s = self.lock();
        s.list_builds_called = true;

        let (status, images) = if s.build_already_done {
            let image = RegistryImage {
                image_id: "image-id".into(),
                provider_name: "mock".into(),
                provider_region: "somewhere".into(),
                ..Default::default()
            };
            (BuildStatus::Done, vec![image])
        } else {
            (BuildStatus::Unset, Vec::new())
        };

        Ok(s.existing_builds
            .iter()
            .enumerate()
            .map(|(i, name)| RemoteBuild {
                id: BuildId::from_str(format!("{name}--{i}")),
                version_id: version_id.clone(),
                component_type: name.clone(),
                run_uuid: RunUuid::from_str("previous-run"),
                status,
                cloud_provider: "mockPlatform".into(),
                labels: s.existing_build_labels.clone(),
                images: images.clone(),
            })
            .collect())
    }
}
