use std::sync::Arc;

use kiln_core::{ArtifactRef, BasicArtifact, CancelToken, RegistryImage, RunUuid};
use kiln_registry::{Bucket, BuildStatus, RegistryError, RegistryService, TemplateType, Version};
use kiln_registry_sqlite::SqliteService;

fn bucket(service: &Arc<SqliteService>, fingerprint: &str) -> Bucket {
    let svc: Arc<dyn RegistryService> = service.clone();
    let mut bucket = Bucket::with_service("web", Version::new(fingerprint, RunUuid::new()), svc);
    bucket.register_build_for_component("docker.ubuntu").unwrap();
    bucket
}

fn image_artifact() -> ArtifactRef {
    let image = RegistryImage {
        image_id: "sha256:abc".into(),
        provider_name: "docker".into(),
        provider_region: "local".into(),
        ..Default::default()
    };
    Arc::new(BasicArtifact::new("kiln.file", "sha256:abc").with_images(&[image]))
}

#[tokio::test]
async fn full_lifecycle_completes_the_version() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(SqliteService::open(&dir.path().join("registry.db")).unwrap());

    let first = bucket(&service, "fp-1");
    first.initialize(TemplateType::Block).await.unwrap();
    first.populate_version().await.unwrap();
    let first = Arc::new(first);
    let cancel = CancelToken::new();

    first.start_build(&cancel, "docker.ubuntu").await.unwrap();
    let (artifacts, res) = first.complete_build(&cancel, "docker.ubuntu", vec![image_artifact()], None).await;
    res.unwrap();
    assert_eq!(artifacts.len(), 2);

    let remote = service.list_builds("web", &first.version.id()).await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].status, BuildStatus::Done);
    assert_eq!(remote[0].images.len(), 1);

    // Same fingerprint again: the bucket is updated, the version is complete.
    let second = bucket(&service, "fp-1");
    let err = second.initialize(TemplateType::Block).await.unwrap_err();
    assert!(matches!(err, RegistryError::VersionComplete { .. }));
}

#[tokio::test]
async fn rerun_resumes_unfinished_builds() {
    let service = Arc::new(SqliteService::open_in_memory().unwrap());

    let first = bucket(&service, "fp-2");
    first.initialize(TemplateType::Legacy).await.unwrap();
    first.populate_version().await.unwrap();
    let first_id = first.version.build("docker.ubuntu").unwrap().id;

    let second = bucket(&service, "fp-2");
    second.initialize(TemplateType::Legacy).await.unwrap();
    second.populate_version().await.unwrap();
    let resumed = second.version.build("docker.ubuntu").unwrap();
    assert_eq!(resumed.id, first_id);
    assert_eq!(resumed.run_uuid, second.version.run_uuid);
    assert!(second.is_expecting_build("docker.ubuntu"));

    let third = bucket(&service, "fp-2");
    let err = third.initialize(TemplateType::Block).await.unwrap_err();
    assert!(matches!(err, RegistryError::TemplateTypeMismatch { existing: TemplateType::Legacy, requested: TemplateType::Block }));
}

#[tokio::test]
async fn published_images_are_found_by_later_lookups() {
    let service = Arc::new(SqliteService::open_in_memory().unwrap());
    let cancel = CancelToken::new();

    let first = Arc::new(bucket(&service, "fp-3"));
    first.initialize(TemplateType::Block).await.unwrap();
    first.populate_version().await.unwrap();
    assert!(service.latest_complete_version("web").unwrap().is_none());

    first.start_build(&cancel, "docker.ubuntu").await.unwrap();
    first.complete_build(&cancel, "docker.ubuntu", vec![image_artifact()], None).await.1.unwrap();

    let latest = service.latest_complete_version("web").unwrap().unwrap();
    assert_eq!(latest.id, first.version.id());
    assert_eq!(latest.fingerprint, "fp-3");
    assert_eq!(service.version_by_fingerprint("web", "fp-3").unwrap().unwrap().id, latest.id);

    let images = service.published_images(&latest.id).unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].component_type, "docker.ubuntu");
    assert_eq!(images[0].image.image_id, "sha256:abc");
}
