use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use kiln_core::{RegistryImage, RunUuid, VersionId};

use crate::build::Build;
use crate::error::RegistryError;

/// One version of a bucket, identified by the build fingerprint.
#[derive(Debug, Default)]
pub struct Version {
    id: RwLock<VersionId>,
    pub fingerprint: String,
    pub run_uuid: RunUuid,
    expected_builds: Vec<String>,
    builds: RwLock<HashMap<String, Build>>,
}

impl Version {
    pub fn new(fingerprint: impl Into<String>, run_uuid: RunUuid) -> Self {
        Self { fingerprint: fingerprint.into(), run_uuid, ..Default::default() }
    }

    pub fn id(&self) -> VersionId {
        self.id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_id(&self, id: VersionId) {
        *self.id.write().unwrap_or_else(PoisonError::into_inner) = id;
    }

    pub fn register_build(&mut self, name: impl Into<String>) -> Result<(), RegistryError> {
        let name = name.into();
        if self.expected_builds.contains(&name) {
            return Err(RegistryError::DuplicateComponent(name));
        }
        self.expected_builds.push(name);
        Ok(())
    }

    pub fn expected_builds(&self) -> &[String] {
        &self.expected_builds
    }

    pub fn has_build(&self, name: &str) -> bool {
        self.builds.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    pub fn build(&self, name: &str) -> Result<Build, RegistryError> {
        self.builds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBuild(name.to_string()))
    }

    pub fn store_build(&self, name: impl Into<String>, build: Build) {
        self.builds.write().unwrap_or_else(PoisonError::into_inner).insert(name.into(), build);
    }

    /// Applies `f` to the stored build under the write lock.
    pub(crate) fn with_build<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Build) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let mut builds = self.builds.write().unwrap_or_else(PoisonError::into_inner);
        let build = builds.get_mut(name).ok_or_else(|| RegistryError::UnknownBuild(name.to_string()))?;
        f(build)
    }

    pub fn add_images_to_build(&self, name: &str, images: &[RegistryImage]) -> Result<(), RegistryError> {
        self.with_build(name, |b| b.add_images(images))
    }

    pub fn add_labels_to_build(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<(), RegistryError> {
        self.with_build(name, |b| {
            b.merge_labels(labels);
            Ok(())
        })
    }

    pub fn add_metadata_to_build(&self, name: &str, metadata: &BTreeMap<String, String>) -> Result<(), RegistryError> {
        self.with_build(name, |b| {
            b.metadata.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    pub fn builds(&self) -> Vec<(String, Build)> {
        let builds = self.builds.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = builds.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_is_rejected() {
        let mut v = Version::new("fp", RunUuid::new());
        v.register_build("docker.ubuntu").unwrap();
        let err = v.register_build("docker.ubuntu").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateComponent(ref n) if n == "docker.ubuntu"));
        assert_eq!(v.expected_builds(), ["docker.ubuntu".to_string()]);
    }

    #[test]
    fn labels_on_unknown_build_fail() {
        let v = Version::new("fp", RunUuid::new());
        let err = v.add_labels_to_build("nope", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownBuild(_)));
    }

    #[test]
    fn stored_build_is_returned_by_value() {
        let v = Version::new("fp", RunUuid::new());
        v.store_build("a", Build { component_type: "a".into(), ..Default::default() });
        let mut snapshot = v.build("a").unwrap();
        snapshot.cloud_provider = "aws".into();
        assert!(v.build("a").unwrap().cloud_provider.is_empty());
        assert!(v.has_build("a"));
    }
}
