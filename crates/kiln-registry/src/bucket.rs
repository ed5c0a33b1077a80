use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use kiln_core::{Artifact, ArtifactRef, CancelToken, RegistryImage, REGISTRY_IMAGES_STATE};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::build::{Build, BuildStatus};
use crate::error::{RegistryError, ServiceError};
use crate::service::{upsert_bucket, BuildUpdate, CreateBuild, RegistryService, RemoteBuild, TemplateType};
use crate::version::Version;

/// How often a running build tells the registry it is still alive.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(120);

/// Builder id of the synthetic artifact appended after a successful publish.
pub const REGISTRY_BUILDER_ID: &str = "kiln.registry";

pub type Connector = Box<dyn Fn() -> Result<Arc<dyn RegistryService>, RegistryError> + Send + Sync>;

/// Version and channel an external source image was published under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentVersion {
    pub version_id: String,
    pub channel_id: String,
}

/// Registry-side container grouping all versions of one image lineage.
pub struct Bucket {
    pub name: String,
    pub description: String,
    destination: RwLock<String>,
    pub bucket_labels: BTreeMap<String, String>,
    pub build_labels: BTreeMap<String, String>,
    /// Source image id to the version that produced it.
    pub source_images_to_parent_versions: BTreeMap<String, ParentVersion>,
    running_builds: Mutex<HashMap<String, watch::Sender<bool>>>,
    pub version: Version,
    connector: Connector,
    service: OnceLock<Arc<dyn RegistryService>>,
    pub heartbeat_period: Duration,
}

impl Bucket {
    pub fn new(name: impl Into<String>, version: Version, connector: Connector) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            destination: RwLock::new(String::new()),
            bucket_labels: BTreeMap::new(),
            build_labels: BTreeMap::new(),
            source_images_to_parent_versions: BTreeMap::new(),
            running_builds: Mutex::new(HashMap::new()),
            version,
            connector,
            service: OnceLock::new(),
            heartbeat_period: HEARTBEAT_PERIOD,
        }
    }

    pub fn with_service(name: impl Into<String>, version: Version, service: Arc<dyn RegistryService>) -> Self {
        Self::new(name, version, Box::new(move || Ok(Arc::clone(&service))))
    }

    pub fn destination(&self) -> String {
        self.destination.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn register_build_for_component(&mut self, name: impl Into<String>) -> Result<(), RegistryError> {
        self.version.register_build(name)
    }

    fn connect(&self) -> Result<Arc<dyn RegistryService>, RegistryError> {
        if let Some(service) = self.service.get() {
            return Ok(Arc::clone(service));
        }
        let service = (self.connector)()?;
        Ok(Arc::clone(self.service.get_or_init(|| service)))
    }

    /// Connects, upserts the bucket and loads or creates the version for the
    /// configured fingerprint. Must run before anything is published.
    pub async fn initialize(&self, template_type: TemplateType) -> Result<(), RegistryError> {
        let service = self.connect()?;
        *self.destination.write().unwrap_or_else(PoisonError::into_inner) = service.destination();

        upsert_bucket(service.as_ref(), &self.name, &self.description, &self.bucket_labels)
            .await
            .map_err(|source| RegistryError::BucketInit { bucket: self.name.clone(), source })?;

        self.initialize_version(service.as_ref(), template_type).await
    }

    async fn initialize_version(&self, service: &dyn RegistryService, template_type: TemplateType) -> Result<(), RegistryError> {
        let fingerprint = self.version.fingerprint.clone();
        let version_init = |source: ServiceError| RegistryError::VersionInit { fingerprint: fingerprint.clone(), source };

        let remote = match service.get_version(&self.name, &fingerprint).await {
            Ok(remote) => remote,
            Err(e) if e.is_missing() => {
                if template_type == TemplateType::Unset {
                    return Err(RegistryError::UnsetTemplateType);
                }
                let created = service.create_version(&self.name, &fingerprint, template_type).await.map_err(version_init)?;
                tracing::debug!(bucket = %self.name, version_id = %created.id, "created version");
                created
            }
            Err(e) => return Err(version_init(e)),
        };

        if remote.template_type != TemplateType::Unset && remote.template_type != template_type {
            return Err(RegistryError::TemplateTypeMismatch { existing: remote.template_type, requested: template_type });
        }

        tracing::debug!(version_id = %remote.id, "using version");
        self.version.set_id(remote.id);

        if remote.complete {
            return Err(RegistryError::VersionComplete { fingerprint });
        }
        Ok(())
    }

    /// Loads the builds that already exist remotely for this version and
    /// creates the missing ones concurrently.
    pub async fn populate_version(&self) -> Result<(), RegistryError> {
        let service = self.connect()?;
        let version_id = self.version.id();
        let existing = service.list_builds(&self.name, &version_id).await.map_err(RegistryError::ListBuilds)?;

        let mut to_create = Vec::new();
        for expected in self.version.expected_builds() {
            match existing.iter().find(|b| &b.component_type == expected) {
                Some(remote) => {
                    let mut build = Build::from_remote(remote);
                    // Runs against an existing build belong to this run from now on.
                    build.run_uuid = self.version.run_uuid.clone();
                    if build.is_not_done() && !self.build_labels.is_empty() {
                        build.merge_labels(&self.build_labels);
                    }
                    tracing::trace!(component = %expected, "build already exists, skipping create");
                    self.version.store_build(expected.clone(), build);
                }
                None => to_create.push(expected.clone()),
            }
        }

        if to_create.is_empty() {
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for name in to_create {
            let service = Arc::clone(&service);
            let req = self.create_build_request(&name);
            tasks.spawn(async move {
                let res = service.create_build(req).await;
                (name, res)
            });
        }

        let mut errs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(remote))) => self.store_initial_build(&name, &remote),
                Ok((name, Err(e))) if e.is_already_exists() => {
                    tracing::trace!(component = %name, "build already exists in the registry, continuing");
                }
                Ok((_, Err(e))) => errs.push(RegistryError::from(e)),
                Err(e) => errs.push(RegistryError::from(ServiceError::Transport(e.to_string()))),
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Multiple(errs))
        }
    }

    fn create_build_request(&self, name: &str) -> CreateBuild {
        CreateBuild {
            bucket_name: self.name.clone(),
            version_id: self.version.id(),
            fingerprint: self.version.fingerprint.clone(),
            run_uuid: self.version.run_uuid.clone(),
            component_type: name.to_string(),
            status: BuildStatus::Unset,
        }
    }

    fn store_initial_build(&self, name: &str, remote: &RemoteBuild) {
        let mut build = Build::from_remote(remote);
        build.labels.clear();
        build.images.clear();
        // Filtered builds only receive the bucket's build labels once they actually run.
        build.merge_labels(&self.build_labels);
        self.version.store_build(name, build);
    }

    pub async fn create_initial_build(&self, name: &str) -> Result<(), RegistryError> {
        let service = self.connect()?;
        let remote = service.create_build(self.create_build_request(name)).await?;
        self.store_initial_build(name, &remote);
        Ok(())
    }

    pub async fn update_build_status(&self, name: &str, status: BuildStatus) -> Result<(), RegistryError> {
        if status == BuildStatus::Done {
            return Err(RegistryError::DoneViaStatusUpdate);
        }

        let build = self.version.build(name)?;
        if build.id.is_empty() {
            return Err(RegistryError::MissingBuildId(name.to_string()));
        }
        if build.status == BuildStatus::Done {
            return Err(RegistryError::BuildIsDone(name.to_string()));
        }

        let service = self.connect()?;
        service.update_build(BuildUpdate::status(build.id, build.run_uuid, status)).await?;
        self.version.with_build(name, |b| {
            b.status = status;
            Ok(())
        })
    }

    /// Publishes the images of `name` and marks it DONE. A build without
    /// images cannot be completed.
    pub async fn mark_build_complete(&self, name: &str) -> Result<(), RegistryError> {
        let build = self.version.build(name)?;
        if build.id.is_empty() {
            return Err(RegistryError::MissingBuildId(name.to_string()));
        }
        if build.status == BuildStatus::Done {
            return Ok(());
        }
        if build.images.is_empty() {
            return Err(RegistryError::NoImages);
        }

        let mut source_image_id = String::new();
        let mut parent = ParentVersion::default();
        for image in build.images.values() {
            if !image.source_image_id.is_empty() {
                source_image_id = image.source_image_id.clone();
            }
            if let Some(p) = self.source_images_to_parent_versions.get(&image.source_image_id) {
                parent = p.clone();
            }
        }

        let non_empty = |s: String| Some(s).filter(|s| !s.is_empty());
        let update = BuildUpdate {
            build_id: build.id.clone(),
            run_uuid: build.run_uuid.clone(),
            status: BuildStatus::Done,
            cloud_provider: non_empty(build.cloud_provider.clone()),
            source_image_id: non_empty(source_image_id),
            source_version_id: non_empty(parent.version_id),
            source_channel_id: non_empty(parent.channel_id),
            labels: Some(build.labels.clone()),
            metadata: Some(build.metadata.clone()).filter(|m| !m.is_empty()),
            images: Some(build.images.values().cloned().collect()),
        };

        let service = self.connect()?;
        service.update_build(update).await?;
        self.version.with_build(name, |b| {
            b.status = BuildStatus::Done;
            Ok(())
        })
    }

    pub fn is_expecting_build(&self, name: &str) -> bool {
        match self.version.build(name) {
            Ok(build) => build.is_not_done(),
            Err(_) => false,
        }
    }

    /// Marks `name` RUNNING and starts its heartbeat loop. The loop stops
    /// when [`Bucket::complete_build`] signals it, or on cancellation after
    /// moving the build to CANCELLED.
    pub async fn start_build(self: &Arc<Self>, cancel: &CancelToken, name: &str) -> Result<(), RegistryError> {
        if !self.is_expecting_build(name) {
            return Err(RegistryError::BuildAlreadyDone { name: name.to_string() });
        }

        self.update_build_status(name, BuildStatus::Running)
            .await
            .map_err(|e| RegistryError::StatusUpdate { name: name.to_string(), source: Box::new(e) })?;

        let (done_tx, done_rx) = watch::channel(false);
        self.running_builds.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string(), done_tx);

        let bucket = Arc::clone(self);
        let cancel = cancel.clone();
        let name = name.to_string();
        tokio::spawn(async move { bucket.heartbeat(&cancel, &name, done_rx).await });
        Ok(())
    }

    async fn heartbeat(&self, cancel: &CancelToken, name: &str, mut done: watch::Receiver<bool>) {
        let (build, service) = match (self.version.build(name), self.connect()) {
            (Ok(build), Ok(service)) => (build, service),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(build = name, error = %e, "failed to start heartbeat");
                return;
            }
        };

        tracing::trace!(build = name, "starting heartbeats");
        let mut tick = tokio::time::interval(self.heartbeat_period);
        // The first tick completes immediately; the build was just marked RUNNING.
        tick.tick().await;

        loop {
            // Done wins over cancel so a finished build is never reported CANCELLED.
            tokio::select! {
                biased;
                _ = done.changed() => break,
                _ = cancel.cancelled() => {
                    if let Err(e) = self.update_build_status(name, BuildStatus::Cancelled).await {
                        tracing::error!(build = name, error = %e, "failed to update registry status");
                    }
                    break;
                }
                _ = tick.tick() => {
                    let update = BuildUpdate::status(build.id.clone(), build.run_uuid.clone(), BuildStatus::Running);
                    match service.update_build(update).await {
                        Ok(_) => tracing::trace!(build = name, "heartbeat sent"),
                        Err(e) => tracing::error!(build = name, error = %e, "failed to send heartbeat"),
                    }
                }
            }
        }
        tracing::trace!(build = name, "stopped heartbeating");
    }

    /// Stops the heartbeat of `name` and publishes what it produced.
    ///
    /// Always hands back the input artifacts, plus a registry artifact when
    /// publishing succeeded.
    pub async fn complete_build(
        &self,
        cancel: &CancelToken,
        name: &str,
        mut artifacts: Vec<ArtifactRef>,
        run_err: Option<&anyhow::Error>,
    ) -> (Vec<ArtifactRef>, Result<(), RegistryError>) {
        let done = self.running_builds.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
        match done {
            Some(tx) => {
                tx.send_replace(true);
                tracing::trace!(build = name, "signalled heartbeat stop");
            }
            None => tracing::error!(build = name, "done build does not have an entry in the heartbeat table, state will be inconsistent."),
        }

        if let Some(err) = run_err {
            let status = if cancel.is_cancelled() { BuildStatus::Cancelled } else { BuildStatus::Failed };
            tracing::debug!(build = name, error = %err, %status, "build did not succeed");
            if let Err(e) = self.update_build_status(name, status).await {
                tracing::error!(build = name, error = %e, "failed to update build status to {status}");
            }
            return (artifacts, Err(RegistryError::BuildFailed));
        }

        for artifact in &artifacts {
            let Some(images) = registry_images(artifact.as_ref()) else {
                continue;
            };
            if let Err(e) = self.version.add_images_to_build(name, &images) {
                return (artifacts, Err(e));
            }
        }

        match self.version.build(name) {
            Ok(build) if build.images.is_empty() => {
                return (artifacts, Err(RegistryError::NotRegistryArtifact { name: name.to_string() }));
            }
            Ok(_) => {}
            Err(e) => return (artifacts, Err(e)),
        }

        if let Err(e) = self.mark_build_complete(name).await {
            return (artifacts, Err(RegistryError::PublishImages { name: name.to_string(), source: Box::new(e) }));
        }

        artifacts.push(Arc::new(RegistryArtifact {
            build_name: name.to_string(),
            bucket: self.name.clone(),
            version_id: self.version.id().to_string(),
        }));
        (artifacts, Ok(()))
    }
}

fn registry_images(artifact: &dyn Artifact) -> Option<Vec<RegistryImage>> {
    let state = artifact.state(REGISTRY_IMAGES_STATE)?;
    let decoded = serde_json::from_value::<Vec<RegistryImage>>(state.clone())
        .or_else(|_| serde_json::from_value::<RegistryImage>(state).map(|image| vec![image]));
    match decoded {
        Ok(images) => Some(images),
        Err(e) => {
            tracing::warn!(builder_id = artifact.builder_id(), error = %e, "artifact carries incompatible registry state, skipping");
            None
        }
    }
}

/// Reference to the published bucket and version.
#[derive(Clone, Debug)]
pub struct RegistryArtifact {
    pub build_name: String,
    pub bucket: String,
    pub version_id: String,
}

impl Artifact for RegistryArtifact {
    fn builder_id(&self) -> &str {
        REGISTRY_BUILDER_ID
    }

    fn id(&self) -> String {
        self.version_id.clone()
    }

    fn files(&self) -> Vec<String> {
        Vec::new()
    }

    fn string(&self) -> String {
        format!("Published metadata to the kiln registry {}/versions/{}", self.bucket, self.version_id)
    }

    fn state(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }

    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
