use std::path::PathBuf;
use std::sync::Arc;

use kiln_config::RegistrySetup;
use kiln_core::{Diagnostic, Diagnostics, SharedUi};
use kiln_registry::{
    fingerprint, run_uuid, Bucket, BucketRegistry, Connector, NullRegistry, Registry, RegistryEnv, RegistryError, RegistryService,
    Version, KILN_BUCKET_NAME, KILN_CLIENT_ID, KILN_CLIENT_SECRET,
};
use kiln_registry_sqlite::{database_path, SqliteService};

/// Connector opening the local SQLite registry at `db`. The service is only
/// opened when the bucket first needs it.
pub fn sqlite_connector(db: PathBuf, destination: String) -> Connector {
    Box::new(move || {
        let service = SqliteService::open(&db)
            .map_err(|e| RegistryError::Connect(format!("{e:#}")))?
            .with_destination(destination.clone());
        let service: Arc<dyn RegistryService> = Arc::new(service);
        Ok(service)
    })
}

/// Database used by registry sync: `KILN_REGISTRY_DB`, else the user
/// settings value.
pub fn registry_database(env: &RegistryEnv, settings_db: &str) -> PathBuf {
    database_path(env.database.as_deref().or(Some(settings_db)))
}

/// `KILN_BUCKET_NAME`, else the registry block's `bucket_name`, else the
/// name of the build block.
pub fn bucket_name(setup: &RegistrySetup, env: &RegistryEnv) -> String {
    if let Some(name) = &env.bucket_name {
        return name.clone();
    }
    match setup.registry_blocks.first() {
        Some(block) if !block.bucket_name.is_empty() => block.bucket_name.clone(),
        _ => setup.build_name.clone(),
    }
}

fn is_enabled(setup: &RegistrySetup, env: &RegistryEnv) -> bool {
    if env.is_disabled() {
        return false;
    }
    setup.has_registry_block() || env.has_bucket_name() || env.is_explicitly_enabled()
}

/// Builds the registry for a run. Sync is off unless a `registry` block,
/// `KILN_BUCKET_NAME` or `KILN_REGISTRY` asks for it, in which case every
/// problem with the setup is an error diagnostic.
pub fn setup_registry(setup: &RegistrySetup, env: &RegistryEnv, connector: Connector, ui: SharedUi) -> (Arc<dyn Registry>, Diagnostics) {
    let mut diags = Diagnostics::new();
    if !is_enabled(setup, env) {
        tracing::debug!("registry sync disabled");
        return (Arc::new(NullRegistry), diags);
    }

    if setup.registry_blocks.len() > 1 {
        diags.push(Diagnostic::error("Multiple build blocks").with_detail(
            "For registry enabled builds, only one build block can carry a registry block. Please remove any additional \
             registry block(s). If these builds are not meant for the registry please clear any KILN_* registry \
             environment variables.",
        ));
    }

    let block = setup.registry_blocks.first().cloned().unwrap_or_default();
    let bucket_name = bucket_name(setup, env);

    if !env.has_credentials() {
        diags.push(Diagnostic::error("registry authentication information required").with_detail(format!(
            "The client authentication requires both {KILN_CLIENT_ID} and {KILN_CLIENT_SECRET} environment variables to be set \
             for authenticating with the registry."
        )));
    }
    if bucket_name.is_empty() {
        diags.push(Diagnostic::error("bucket name cannot be empty").with_detail(format!(
            "empty bucket name, please set it with the {KILN_BUCKET_NAME} environment variable, or in a `registry` block"
        )));
    }

    let version = Version::new(fingerprint(env, &setup.template_dir), run_uuid(env));
    let mut bucket = Bucket::new(bucket_name, version, connector);
    bucket.description = if block.description.is_empty() { setup.build_description.clone() } else { block.description };
    bucket.bucket_labels = block.bucket_labels;
    bucket.build_labels = block.build_labels;
    bucket.source_images_to_parent_versions = setup.parent_versions.clone();

    for component in &setup.components {
        if let Err(e) = bucket.register_build_for_component(component.clone()) {
            diags.push(Diagnostic::error("Unable to register build for the registry").with_detail(e.to_string()).with_subject(component));
        }
    }

    if diags.has_errors() {
        return (Arc::new(NullRegistry), diags);
    }
    tracing::info!(bucket = %bucket.name, fingerprint = %bucket.version.fingerprint, "registry sync enabled");
    (Arc::new(BucketRegistry::new(bucket, setup.template_type, ui)), diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_config::RegistryBlock;
    use kiln_core::RecordingUi;
    use kiln_registry::{MockService, TemplateType, KILN_BUILD_FINGERPRINT, KILN_REGISTRY};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> RegistryEnv {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RegistryEnv::from_lookup(|k| map.get(k).cloned())
    }

    fn creds(extra: &[(&'static str, &'static str)]) -> RegistryEnv {
        let mut pairs = vec![(KILN_CLIENT_ID, "id"), (KILN_CLIENT_SECRET, "secret"), (KILN_BUILD_FINGERPRINT, "fp")];
        pairs.extend_from_slice(extra);
        env(&pairs)
    }

    fn mock() -> Connector {
        let service: Arc<dyn RegistryService> = Arc::new(MockService::new());
        Box::new(move || Ok(service.clone()))
    }

    fn setup(blocks: usize) -> RegistrySetup {
        RegistrySetup {
            template_type: TemplateType::Block,
            build_blocks: blocks.max(1),
            registry_blocks: (0..blocks).map(|_| RegistryBlock { bucket_name: "from-block".into(), ..Default::default() }).collect(),
            build_name: "web".into(),
            build_description: "web images".into(),
            components: vec!["web.null.a".into()],
            ..Default::default()
        }
    }

    fn summaries(diags: &Diagnostics) -> Vec<String> {
        diags.errors().map(|d| d.summary.clone()).collect()
    }

    fn ui() -> SharedUi {
        Arc::new(RecordingUi::new())
    }

    #[test]
    fn no_trigger_means_no_sync_and_no_diagnostics() {
        let (_, diags) = setup_registry(&setup(0), &env(&[]), mock(), ui());
        assert!(diags.is_empty());
    }

    #[test]
    fn off_wins_over_a_registry_block() {
        let (_, diags) = setup_registry(&setup(1), &env(&[(KILN_REGISTRY, "off")]), mock(), ui());
        assert!(diags.is_empty());
    }

    #[test]
    fn missing_credentials_are_reported() {
        let (_, diags) = setup_registry(&setup(1), &env(&[]), mock(), ui());
        assert_eq!(summaries(&diags), vec!["registry authentication information required"]);
    }

    #[test]
    fn more_than_one_registry_block_is_an_error() {
        let (_, diags) = setup_registry(&setup(2), &creds(&[]), mock(), ui());
        assert_eq!(summaries(&diags), vec!["Multiple build blocks"]);
    }

    #[test]
    fn explicit_enable_without_any_name_is_an_error() {
        let mut s = setup(0);
        s.build_name.clear();
        let (_, diags) = setup_registry(&s, &creds(&[(KILN_REGISTRY, "1")]), mock(), ui());
        assert_eq!(summaries(&diags), vec!["bucket name cannot be empty"]);
    }

    #[test]
    fn bucket_name_prefers_env_then_block_then_build_name() {
        assert_eq!(bucket_name(&setup(1), &creds(&[(KILN_BUCKET_NAME, "from-env")])), "from-env");
        assert_eq!(bucket_name(&setup(1), &creds(&[])), "from-block");
        assert_eq!(bucket_name(&setup(0), &creds(&[])), "web");
    }

    #[test]
    fn duplicate_components_report_a_conflict() {
        let mut s = setup(1);
        s.components = vec!["web.null.a".into(), "web.null.a".into()];
        let (_, diags) = setup_registry(&s, &creds(&[]), mock(), ui());
        assert_eq!(summaries(&diags), vec!["Unable to register build for the registry"]);
        assert!(diags.errors().next().unwrap().detail.contains("web.null.a"));
    }

    #[tokio::test]
    async fn enabled_registry_populates_through_the_connector() {
        let service = Arc::new(MockService::new());
        let svc: Arc<dyn RegistryService> = service.clone();
        let (registry, diags) = setup_registry(&setup(1), &creds(&[]), Box::new(move || Ok(svc.clone())), ui());
        assert!(diags.is_empty(), "{diags:?}");
        registry.populate_version().await.unwrap();

        let state = service.state();
        assert!(state.create_bucket_called);
        assert!(state.create_version_called);
        assert!(state.create_build_called);
    }
}
