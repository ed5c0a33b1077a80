use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::filter::OnlyExcept;
use crate::variables::VariableDecl;

pub const TEMPLATE_SUFFIX: &str = ".kiln.toml";

/// One `*.kiln.toml` file, or several merged together.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    pub locals: BTreeMap<String, Value>,
    #[serde(default)]
    pub data: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub source: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
    #[serde(default)]
    pub build: Vec<BuildBlock>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildBlock {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sources: Vec<SourceUse>,
    #[serde(default)]
    pub provisioner: Vec<ProvisionerBlock>,
    #[serde(default)]
    pub error_cleanup_provisioner: Option<ProvisionerBlock>,
    #[serde(default)]
    pub post_processor: Vec<PostProcessorBlock>,
    #[serde(default)]
    pub post_processors: Vec<PostProcessorChain>,
    #[serde(default)]
    pub registry: Option<RegistryBlock>,
}

impl BuildBlock {
    /// Every chain in declaration order: single steps first, then the
    /// explicit chains.
    pub fn post_processor_chains(&self) -> Vec<Vec<&PostProcessorBlock>> {
        let singles = self.post_processor.iter().map(|pp| vec![pp]);
        let chains = self.post_processors.iter().map(|c| c.post_processor.iter().collect());
        singles.chain(chains).collect()
    }
}

/// `sources = ["source.null.a", { source = "null.b", name = "b2", config = {...} }]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceUse {
    Ref(String),
    Block {
        source: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        config: Map<String, Value>,
    },
}

/// `type.name` of a source definition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
}

impl SourceRef {
    /// Accepts `source.type.name` and `type.name`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.strip_prefix("source.").unwrap_or(raw);
        let (kind, name) = raw.split_once('.')?;
        if kind.is_empty() || name.is_empty() || name.contains('.') {
            return None;
        }
        Some(Self { kind: kind.to_string(), name: name.to_string() })
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl SourceUse {
    pub fn raw_ref(&self) -> &str {
        match self {
            SourceUse::Ref(r) => r,
            SourceUse::Block { source, .. } => source,
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        match self {
            SourceUse::Ref(_) => None,
            SourceUse::Block { name, .. } => name.as_deref(),
        }
    }

    pub fn config(&self) -> Option<&Map<String, Value>> {
        match self {
            SourceUse::Ref(_) => None,
            SourceUse::Block { config, .. } => Some(config),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerBlock {
    #[serde(rename = "type")]
    pub ptype: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub filter: OnlyExcept,
    #[serde(default)]
    pub pause_before: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    /// Per source name configuration, merged over `config`.
    #[serde(default, rename = "override")]
    pub overrides: BTreeMap<String, Map<String, Value>>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl ProvisionerBlock {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.ptype
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessorBlock {
    #[serde(rename = "type")]
    pub ptype: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub filter: OnlyExcept,
    #[serde(default)]
    pub keep_input_artifact: Option<bool>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl PostProcessorBlock {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.ptype
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcessorChain {
    #[serde(default)]
    pub post_processor: Vec<PostProcessorBlock>,
}

/// `[build.registry]`: where this build's metadata is published.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryBlock {
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bucket_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub build_labels: BTreeMap<String, String>,
}

impl BlockTemplate {
    pub fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&raw, path)
    }

    /// Loads a single file, or every `*.kiln.toml` in a directory merged in
    /// file name order.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_dir() {
            return Self::load_file(path);
        }
        let entries = std::fs::read_dir(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(TEMPLATE_SUFFIX)))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(ConfigError::NoTemplates(path.to_path_buf()));
        }

        let mut merged = BlockTemplate::default();
        for file in files {
            tracing::debug!(file = %file.display(), "loading template file");
            merged.merge(Self::load_file(&file)?, &file)?;
        }
        Ok(merged)
    }

    /// Adds the blocks of `other`; names must stay unique across files.
    pub fn merge(&mut self, other: BlockTemplate, path: &Path) -> Result<(), ConfigError> {
        let dup = |kind: &'static str, name: String| ConfigError::Duplicate { kind, name, path: path.to_path_buf() };

        for (name, decl) in other.variables {
            if self.variables.contains_key(&name) {
                return Err(dup("variable", name));
            }
            self.variables.insert(name, decl);
        }
        for (name, expr) in other.locals {
            if self.locals.contains_key(&name) {
                return Err(dup("local", name));
            }
            self.locals.insert(name, expr);
        }
        for (kind, by_name) in other.data {
            let slot = self.data.entry(kind.clone()).or_default();
            for (name, body) in by_name {
                if slot.contains_key(&name) {
                    return Err(dup("data", format!("data.{kind}.{name}")));
                }
                slot.insert(name, body);
            }
        }
        for (kind, by_name) in other.source {
            let slot = self.source.entry(kind.clone()).or_default();
            for (name, body) in by_name {
                if slot.contains_key(&name) {
                    return Err(dup("source", format!("source.{kind}.{name}")));
                }
                slot.insert(name, body);
            }
        }
        self.build.extend(other.build);
        Ok(())
    }

    pub fn source_refs(&self) -> Vec<SourceRef> {
        self.source
            .iter()
            .flat_map(|(kind, by_name)| by_name.keys().map(move |name| SourceRef { kind: kind.clone(), name: name.clone() }))
            .collect()
    }

    pub fn source_body(&self, r: &SourceRef) -> Option<&Map<String, Value>> {
        self.source.get(&r.kind).and_then(|m| m.get(&r.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE: &str = r#"
[variables.region]
default = "eu-west-1"

[locals]
image = "${var.region}-base"

[data.static.base]
value = { id = "img-1" }

[source.null.ubuntu]
communicator = "none"

[[build]]
name = "web"
sources = ["source.null.ubuntu", { source = "null.ubuntu", name = "second", config = { extra = true } }]

[[build.provisioner]]
type = "shell-local"
only = ["null.ubuntu"]
max_retries = 2
pause_before = "1s"
inline = ["echo hi"]

[build.provisioner.override.second]
inline = ["echo second"]

[[build.post_processor]]
type = "manifest"
keep_input_artifact = true

[[build.post_processors]]
[[build.post_processors.post_processor]]
type = "checksum"
[[build.post_processors.post_processor]]
type = "manifest"
name = "after-checksum"

[build.registry]
bucket_name = "web-images"
bucket_labels = { team = "infra" }
"#;

    #[test]
    fn parses_every_block_kind() {
        let t = BlockTemplate::parse(TEMPLATE, Path::new("t.kiln.toml")).unwrap();
        assert_eq!(t.variables["region"].default, Some(json!("eu-west-1")));
        assert_eq!(t.locals["image"], json!("${var.region}-base"));
        assert_eq!(t.data["static"]["base"], json!({"value": {"id": "img-1"}}));
        assert_eq!(t.source_refs(), vec![SourceRef { kind: "null".into(), name: "ubuntu".into() }]);

        let b = &t.build[0];
        assert_eq!(b.name, "web");
        assert_eq!(b.sources.len(), 2);
        assert_eq!(b.sources[1].local_name(), Some("second"));

        let p = &b.provisioner[0];
        assert_eq!(p.ptype, "shell-local");
        assert_eq!(p.filter.only, vec!["null.ubuntu".to_string()]);
        assert_eq!(p.max_retries, 2);
        assert_eq!(p.config.get("inline"), Some(&json!(["echo hi"])));
        assert!(!p.config.contains_key("only"));
        assert_eq!(p.overrides["second"].get("inline"), Some(&json!(["echo second"])));

        let chains = b.post_processor_chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0][0].keep_input_artifact, Some(true));
        assert_eq!(chains[1].iter().map(|pp| pp.display_name()).collect::<Vec<_>>(), vec!["checksum", "after-checksum"]);

        let reg = b.registry.as_ref().unwrap();
        assert_eq!(reg.bucket_name, "web-images");
        assert_eq!(reg.bucket_labels["team"], "infra");
    }

    #[test]
    fn source_refs_parse() {
        assert_eq!(SourceRef::parse("source.null.a"), Some(SourceRef { kind: "null".into(), name: "a".into() }));
        assert_eq!(SourceRef::parse("null.a").unwrap().to_string(), "null.a");
        assert_eq!(SourceRef::parse("null"), None);
        assert_eq!(SourceRef::parse("a.b.c"), None);
    }

    #[test]
    fn directory_merge_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.kiln.toml"), "[source.null.a]\n[[build]]\nsources = [\"null.a\"]\n").unwrap();
        std::fs::write(dir.path().join("b.kiln.toml"), "[source.null.b]\n[[build]]\nsources = [\"null.b\"]\n").unwrap();
        std::fs::write(dir.path().join("notes.toml"), "ignored = true\n").unwrap();

        let t = BlockTemplate::load(dir.path()).unwrap();
        assert_eq!(t.source_refs().len(), 2);
        assert_eq!(t.build.len(), 2);

        std::fs::write(dir.path().join("c.kiln.toml"), "[locals]\nx = 1\n[source.null.a]\n").unwrap();
        let err = BlockTemplate::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { kind: "source", .. }));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(BlockTemplate::load(dir.path()), Err(ConfigError::NoTemplates(_))));
    }
}
