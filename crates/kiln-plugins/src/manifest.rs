use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use kiln_core::{ArtifactRef, BuilderVariables, CancelToken, ConfigValue, PostProcessed, PostProcessor, SharedUi, BUILDER_TYPE_VAR, BUILD_NAME_VAR};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const DEFAULT_OUTPUT: &str = "kiln-manifest.json";

/// Builds of one run may share a manifest file.
static MANIFEST_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManifestConfig {
    #[serde(default)]
    pub output: String,
    /// Record file names without their directories.
    #[serde(default)]
    pub strip_path: bool,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub builder_type: String,
    pub build_time: i64,
    pub files: Vec<ManifestFile>,
    pub artifact_id: String,
    pub kiln_run_uuid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub builds: Vec<ManifestEntry>,
    pub last_run_uuid: String,
}

/// Appends one entry per artifact to a JSON manifest file. The input
/// artifact is always kept.
#[derive(Default)]
pub struct ManifestPostProcessor {
    config: ManifestConfig,
    build_name: String,
    builder_type: String,
}

impl ManifestPostProcessor {
    fn entry(&self, artifact: &ArtifactRef, run_uuid: &str) -> ManifestEntry {
        let files = artifact
            .files()
            .into_iter()
            .map(|file| {
                let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or_default();
                let name = if self.config.strip_path {
                    Path::new(&file).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or(file)
                } else {
                    file
                };
                ManifestFile { name, size }
            })
            .collect();
        ManifestEntry {
            name: self.build_name.clone(),
            builder_type: self.builder_type.clone(),
            build_time: chrono::Utc::now().timestamp(),
            files,
            artifact_id: artifact.id(),
            kiln_run_uuid: run_uuid.to_string(),
            custom_data: self.config.custom_data.clone(),
        }
    }
}

async fn read_manifest(path: &Path) -> anyhow::Result<Manifest> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Manifest::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| format!("Unable to parse content from {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(e) => Err(e).with_context(|| format!("Unable to read {}", path.display())),
    }
}

#[async_trait]
impl PostProcessor for ManifestPostProcessor {
    fn configure(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        let mut parsed: ManifestConfig = crate::decode("manifest", config)?;
        if parsed.output.is_empty() {
            parsed.output = DEFAULT_OUTPUT.to_string();
        }
        self.build_name = vars.get(BUILD_NAME_VAR).cloned().unwrap_or_default();
        self.builder_type = vars.get(BUILDER_TYPE_VAR).cloned().unwrap_or_default();
        self.config = parsed;
        Ok(())
    }

    async fn post_process(&self, _cancel: &CancelToken, ui: &SharedUi, input: ArtifactRef) -> anyhow::Result<PostProcessed> {
        let run_uuid = std::env::var("KILN_RUN_UUID").unwrap_or_default();
        let entry = self.entry(&input, &run_uuid);
        let path = Path::new(&self.config.output);

        let _guard = MANIFEST_LOCK.lock().await;
        let mut manifest = read_manifest(path).await?;
        manifest.builds.push(entry);
        manifest.last_run_uuid = run_uuid;

        let json = serde_json::to_vec_pretty(&manifest).context("Unable to marshal JSON")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(path, json).await.with_context(|| format!("Unable to write {}", path.display()))?;
        ui.say(&format!("Adding build to manifest {}", path.display()));

        Ok(PostProcessed { artifact: input, keep_input: true, force_keep: true })
    }
}
