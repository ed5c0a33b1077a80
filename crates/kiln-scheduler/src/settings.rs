use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kiln_config::OnError;
use kiln_registry_sqlite::DEFAULT_DATABASE;
use serde::{Deserialize, Serialize};

pub const KILN_CONFIG: &str = "KILN_CONFIG";
pub const DEFAULT_SETTINGS_PATH: &str = "~/.kiln/kiln.toml";

fn default_color() -> bool {
    true
}

fn default_registry_db() -> String {
    DEFAULT_DATABASE.to_string()
}

/// Per-user defaults for `kiln build`, stored in `~/.kiln/kiln.toml`.
/// Command line flags win over these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// 0 runs every build at once.
    #[serde(default)]
    pub parallel_builds: usize,
    #[serde(default = "default_color")]
    pub color: bool,
    #[serde(default)]
    pub timestamp_ui: bool,
    #[serde(default)]
    pub on_error: OnError,
    /// Local registry database; `KILN_REGISTRY_DB` overrides it.
    #[serde(default = "default_registry_db")]
    pub registry_db: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            parallel_builds: 0,
            color: default_color(),
            timestamp_ui: false,
            on_error: OnError::default(),
            registry_db: default_registry_db(),
        }
    }
}

fn expand(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(path),
    }
}

impl UserSettings {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let settings: UserSettings = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// `KILN_CONFIG` if set, else `~/.kiln/kiln.toml`.
    pub fn path() -> PathBuf {
        match std::env::var(KILN_CONFIG) {
            Ok(p) if !p.is_empty() => expand(&p),
            _ => expand(DEFAULT_SETTINGS_PATH),
        }
    }

    /// Settings from [`UserSettings::path`]; defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no user settings, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn registry_db_path(&self) -> PathBuf {
        expand(&self.registry_db)
    }
}
