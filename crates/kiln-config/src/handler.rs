use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use kiln_core::{Diagnostics, PluginContext};
use kiln_registry::{ParentVersion, TemplateType};
use serde::{Deserialize, Serialize};

use crate::block::BlockConfig;
use crate::core_build::CoreBuild;
use crate::error::ConfigError;
use crate::legacy::LegacyConfig;
use crate::template::RegistryBlock;
use crate::variables::VarInputs;

/// What a builder does with its resources when a step fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    #[default]
    Cleanup,
    Abort,
    RunCleanupProvisioner,
}

impl OnError {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnError::Cleanup => "cleanup",
            OnError::Abort => "abort",
            OnError::RunCleanupProvisioner => "run-cleanup-provisioner",
        }
    }
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "cleanup" => Ok(OnError::Cleanup),
            "abort" => Ok(OnError::Abort),
            "run-cleanup-provisioner" => Ok(OnError::RunCleanupProvisioner),
            "ask" => Err("on-error=ask is not supported: kiln builds never stop for interactive input".to_string()),
            other => Err(format!("invalid on-error value {other:?}; expected cleanup, abort or run-cleanup-provisioner")),
        }
    }
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command line switches that shape the build plan.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    pub only: Vec<String>,
    pub except: Vec<String>,
    pub debug: bool,
    pub force: bool,
    pub on_error: OnError,
}

/// Everything registry setup needs to know about a template.
#[derive(Clone, Debug, Default)]
pub struct RegistrySetup {
    pub template_type: TemplateType,
    pub template_dir: PathBuf,
    /// Number of build blocks; legacy templates count as one.
    pub build_blocks: usize,
    /// Registry blocks found, one per build block that has one.
    pub registry_blocks: Vec<RegistryBlock>,
    /// Name and description of the build block that configures the registry.
    pub build_name: String,
    pub build_description: String,
    /// Component names to track, ignoring `-only`/`-except`.
    pub components: Vec<String>,
    /// Source image id to the version and channel it was published under,
    /// taken from registry datasources.
    pub parent_versions: BTreeMap<String, ParentVersion>,
}

impl RegistrySetup {
    pub fn has_registry_block(&self) -> bool {
        !self.registry_blocks.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InspectedBuild {
    pub name: String,
    pub sources: Vec<String>,
    pub provisioners: Vec<String>,
    pub post_processors: Vec<Vec<String>>,
}

/// Summary of a template for `kiln inspect`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inspection {
    /// Variable name to its display value; sensitive ones are masked.
    pub variables: BTreeMap<String, String>,
    pub sources: Vec<String>,
    pub builds: Vec<InspectedBuild>,
}

/// A loaded template, block or legacy. The scheduler drives either through
/// the same sequence of evaluation steps.
pub trait ConfigHandler: Send {
    fn evaluate_datasources(&mut self, skip_execution: bool) -> Diagnostics;
    fn evaluate_variables(&mut self) -> Diagnostics;
    fn evaluate_builds(&mut self) -> Diagnostics;
    fn get_builds(&mut self, opts: &BuildOptions) -> (Vec<CoreBuild>, Diagnostics);
    fn registry_setup(&self) -> RegistrySetup;
    fn inspect(&self) -> Inspection;
    fn base_dir(&self) -> &Path;
}

fn is_legacy(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|e| e == "json")
}

/// Loads `path` as a legacy JSON template or as block templates (a
/// `*.kiln.toml` file or a directory of them). Input variables are evaluated
/// as part of loading.
pub fn load_handler(path: &Path, plugins: PluginContext, inputs: &VarInputs) -> Result<(Box<dyn ConfigHandler>, Diagnostics), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
        });
    }
    if is_legacy(path) {
        let (cfg, diags) = LegacyConfig::load(path, plugins, inputs)?;
        return Ok((Box::new(cfg), diags));
    }
    let (cfg, diags) = BlockConfig::load(path, plugins, inputs)?;
    Ok((Box::new(cfg), diags))
}
