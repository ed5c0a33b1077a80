use std::sync::Arc;

use kiln_core::{BasicArtifact, CancelToken, RecordingUi, RunUuid, SharedUi};
use kiln_registry::{Bucket, BucketRegistry, MockService, NullRegistry, Registry, RegistryService, TemplateType, Version};

#[tokio::test]
async fn null_registry_passes_artifacts_through() {
    let registry = NullRegistry;
    let cancel = CancelToken::new();
    registry.populate_version().await.unwrap();
    registry.start_build(&cancel, "anything").await.unwrap();

    let art = Arc::new(BasicArtifact::new("kiln.null", "a"));
    let (artifacts, res) = registry.complete_build(&cancel, "anything", vec![art], None).await;
    res.unwrap();
    assert_eq!(artifacts.len(), 1);
}

#[tokio::test]
async fn bucket_registry_populates_and_summarizes() {
    let mock = Arc::new(MockService::new());
    let service: Arc<dyn RegistryService> = mock.clone();
    let mut bucket = Bucket::with_service("web", Version::new("fp-1", RunUuid::new()), service);
    bucket.register_build_for_component("docker.ubuntu").unwrap();

    let recording = Arc::new(RecordingUi::new());
    let ui: SharedUi = recording.clone();
    let registry = BucketRegistry::new(bucket, TemplateType::Block, ui.clone());
    registry.populate_version().await.unwrap();

    let build = registry.bucket().version.build("docker.ubuntu").unwrap();
    assert_eq!(build.metadata.get("os").map(String::as_str), Some(std::env::consts::OS));
    assert!(recording.contains("fingerprint \"fp-1\""));

    registry.version_status_summary(&ui);
    assert!(recording.contains("bucket: web"));
    assert!(recording.contains("version: version-id"));
    assert!(recording.contains("docker.ubuntu: UNSET"));
}
