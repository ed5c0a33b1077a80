use std::collections::BTreeMap;
use std::fmt;

use kiln_core::{BuildId, RegistryImage, RunUuid};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::service::RemoteBuild;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    #[default]
    Unset,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Unset => "UNSET",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Done => "DONE",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RUNNING" => BuildStatus::Running,
            "DONE" => BuildStatus::Done,
            "FAILED" => BuildStatus::Failed,
            "CANCELLED" => BuildStatus::Cancelled,
            _ => BuildStatus::Unset,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local view of one registry-tracked build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Build {
    pub id: BuildId,
    pub component_type: String,
    pub run_uuid: RunUuid,
    pub status: BuildStatus,
    pub cloud_provider: String,
    pub labels: BTreeMap<String, String>,
    pub images: BTreeMap<String, RegistryImage>,
    pub metadata: BTreeMap<String, String>,
}

impl Build {
    pub fn from_remote(remote: &RemoteBuild) -> Self {
        Self {
            id: remote.id.clone(),
            component_type: remote.component_type.clone(),
            run_uuid: remote.run_uuid.clone(),
            status: remote.status,
            cloud_provider: remote.cloud_provider.clone(),
            labels: remote.labels.clone(),
            images: remote.images.iter().map(|i| (i.key(), i.clone())).collect(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn merge_labels(&mut self, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.labels.insert(k.clone(), v.clone());
        }
    }

    /// Records images produced for this build. The first image decides the
    /// cloud provider and image labels are merged into the build's labels.
    pub fn add_images(&mut self, images: &[RegistryImage]) -> Result<(), RegistryError> {
        for image in images {
            if image.image_id.is_empty() || image.provider_name.is_empty() {
                return Err(RegistryError::InvalidImage {
                    name: self.component_type.clone(),
                    reason: "an image requires both an image id and a provider name".to_string(),
                });
            }
            if self.cloud_provider.is_empty() {
                self.cloud_provider = image.provider_name.clone();
            }
            self.merge_labels(&image.labels);
            self.images.insert(image.key(), image.clone());
        }
        Ok(())
    }

    /// Whether the build still has to be driven by this run.
    ///
    /// Requires a remote id, no published images and a status other than DONE.
    pub fn is_not_done(&self) -> bool {
        let has_build_id = !self.id.is_empty();
        let has_no_images = self.images.is_empty();
        let is_not_done = self.status != BuildStatus::Done;
        has_build_id && has_no_images && is_not_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str) -> RegistryImage {
        RegistryImage {
            image_id: id.to_string(),
            provider_name: "aws".to_string(),
            provider_region: "eu-west-1".to_string(),
            labels: BTreeMap::from([("arch".to_string(), "arm64".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn is_not_done_requires_all_three_conditions() {
        let mut b = Build { id: BuildId::from_str("b-1"), ..Default::default() };
        assert!(b.is_not_done());

        b.status = BuildStatus::Done;
        assert!(!b.is_not_done());

        b.status = BuildStatus::Running;
        b.add_images(&[image("ami-1")]).unwrap();
        assert!(!b.is_not_done());

        let no_id = Build::default();
        assert!(!no_id.is_not_done());
    }

    #[test]
    fn add_images_sets_provider_and_merges_labels() {
        let mut b = Build::default();
        b.add_images(&[image("ami-1"), image("ami-2")]).unwrap();
        assert_eq!(b.cloud_provider, "aws");
        assert_eq!(b.images.len(), 2);
        assert_eq!(b.labels.get("arch").map(String::as_str), Some("arm64"));
    }

    #[test]
    fn add_images_rejects_incomplete_image() {
        let mut b = Build { component_type: "docker.ubuntu".to_string(), ..Default::default() };
        let err = b.add_images(&[RegistryImage { image_id: "x".to_string(), ..Default::default() }]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidImage { .. }));
        assert!(b.images.is_empty());
    }

    #[test]
    fn merge_labels_overwrites_and_keeps() {
        let mut b = Build::default();
        b.merge_labels(&BTreeMap::from([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]));
        b.merge_labels(&BTreeMap::from([("a".to_string(), "3".to_string())]));
        assert_eq!(b.labels.get("a").map(String::as_str), Some("3"));
        assert_eq!(b.labels.get("b").map(String::as_str), Some("2"));
    }
}
