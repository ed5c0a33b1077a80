mod common;

use std::sync::Arc;

use common::{write_template, Fakes};
use kiln_config::{load_handler, BuildOptions, VarInputs};
use kiln_core::{BuildUnit, CancelToken, RecordingUi, SharedUi};
use kiln_registry::TemplateType;

const LEGACY: &str = r#"{
  "description": "two fake builds",
  "variables": {"greeting": "hello", "token": null},
  "sensitive-variables": ["token"],
  "builders": [
    {"type": "fake", "name": "two", "id": "{{user `greeting`}}-2"},
    {"type": "fake", "name": "one", "id": "{{user `greeting`}}-1"}
  ],
  "provisioners": [
    {"type": "record", "only": ["one"], "msg": "{{build_name}} {{build `ID`}}"},
    {"type": "record", "msg": "plain", "max_retries": "2", "override": {"two": {"msg": "for two"}}}
  ],
  "post-processors": ["wrap", [{"type": "wrap", "name": "outer"}, "wrap"]]
}"#;

fn token() -> VarInputs {
    VarInputs { files: Vec::new(), overrides: vec![("token".into(), "t0ken".into())] }
}

#[test]
fn test_legacy_builds_sorted_and_filtered_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), "template.json", LEGACY);
    let fakes = Fakes::new();
    let mut handler = fakes.load_with(&path, &token());

    let (builds, diags) = handler.get_builds(&BuildOptions::default());
    assert!(diags.is_empty(), "{diags:?}");
    assert_eq!(builds.iter().map(|b| b.name()).collect::<Vec<_>>(), vec!["one", "two"]);
    assert_eq!(builds[0].provisioners.len(), 2);
    assert_eq!(builds[1].provisioners.len(), 1);
    assert_eq!(builds[0].post_processors.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 2]);

    let only = BuildOptions { only: vec!["t*".into()], ..Default::default() };
    let (builds, diags) = handler.get_builds(&only);
    assert!(builds.is_empty(), "legacy filters are exact names");
    assert_eq!(diags.warnings().count(), 1);
}

#[tokio::test]
async fn test_legacy_placeholders_and_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), "template.json", LEGACY);
    let fakes = Fakes::new();
    let mut handler = fakes.load_with(&path, &token());
    let (builds, _) = handler.get_builds(&BuildOptions::default());

    let ui: SharedUi = Arc::new(RecordingUi::new());
    let artifacts = builds[0].run(&CancelToken::new(), ui.clone()).await.unwrap();
    assert_eq!(artifacts.iter().map(|a| a.id()).collect::<Vec<_>>(), vec!["wrapped-hello-1", "wrapped-wrapped-hello-1"]);

    builds[1].run(&CancelToken::new(), ui).await.unwrap();
    let lines = fakes.log.lines();
    assert!(lines.contains(&"provision one i-hello-1".to_string()), "{lines:?}");
    assert!(lines.contains(&"provision plain".to_string()));
    assert!(lines.contains(&"provision for two".to_string()));
}

#[test]
fn test_legacy_registry_setup_and_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), "template.json", LEGACY);
    let fakes = Fakes::new();
    let handler = fakes.load_with(&path, &token());

    let setup = handler.registry_setup();
    assert_eq!(setup.template_type, TemplateType::Legacy);
    assert_eq!(setup.components, vec!["one", "two"]);
    assert_eq!(setup.build_blocks, 1);
    assert!(!setup.has_registry_block());

    let inspection = handler.inspect();
    assert_eq!(inspection.variables["greeting"], "hello");
    assert_eq!(inspection.variables["token"], "<sensitive>");
    assert_eq!(inspection.builds[0].post_processors, vec![vec!["wrap".to_string()], vec!["outer".to_string(), "wrap".to_string()]]);
}

#[test]
fn test_legacy_required_variable_and_bad_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), "template.json", LEGACY);
    let fakes = Fakes::new();
    let (_, diags) = load_handler(&path, fakes.context(), &VarInputs::default()).unwrap();
    assert_eq!(diags.errors().next().unwrap().summary, "Unset variable \"token\"");

    let bad = LEGACY.replace("\"max_retries\": \"2\"", "\"max_retries\": \"lots\"");
    let path = write_template(dir.path(), "bad.json", &bad);
    let (mut handler, _) = load_handler(&path, fakes.context(), &token()).unwrap();
    let diags = handler.evaluate_builds();
    assert_eq!(diags.errors().next().unwrap().summary, "`max_retries` must be a valid integer");
}

#[test]
fn test_missing_template_path() {
    let fakes = Fakes::new();
    let err = load_handler(std::path::Path::new("/definitely/not/here.json"), fakes.context(), &VarInputs::default()).err().unwrap();
    assert!(err.to_string().contains("/definitely/not/here.json"), "{err}");
}
