use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kiln_core::{Diagnostic, Diagnostics, PluginContext, PluginStore, REDACTED};
use kiln_registry::TemplateType;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core_build::{CoreBuild, CoreBuildPostProcessor, CoreBuildProvisioner};
use crate::error::ConfigError;
use crate::eval::EvalContext;
use crate::filter::{BuildFilter, FilterTally, OnlyExcept};
use crate::handler::{BuildOptions, ConfigHandler, InspectedBuild, Inspection, RegistrySetup};
use crate::plan::{builder_variables, merge_config, start_builder, BuildScope, ProvisionerSettings};
use crate::variables::{evaluate_input_variables, VarInputs, VariableDecl};

#[derive(Debug, Default, Deserialize)]
struct LegacyTemplate {
    #[serde(default)]
    description: String,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
    #[serde(default, rename = "sensitive-variables")]
    sensitive_variables: Vec<String>,
    #[serde(default)]
    builders: Vec<LegacyBuilder>,
    #[serde(default)]
    provisioners: Vec<LegacyProvisioner>,
    #[serde(default, rename = "post-processors")]
    post_processors: Vec<PostProcessorEntry>,
    #[serde(default, rename = "error-cleanup-provisioner")]
    error_cleanup_provisioner: Option<LegacyProvisioner>,
}

#[derive(Debug, Deserialize)]
struct LegacyBuilder {
    #[serde(rename = "type")]
    btype: String,
    #[serde(default)]
    name: String,
    #[serde(flatten)]
    config: Map<String, Value>,
}

impl LegacyBuilder {
    fn build_name(&self) -> &str {
        if self.name.is_empty() {
            &self.btype
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyProvisioner {
    #[serde(rename = "type")]
    ptype: String,
    #[serde(flatten)]
    filter: OnlyExcept,
    #[serde(default)]
    pause_before: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    /// A number or a numeric string.
    #[serde(default)]
    max_retries: Option<Value>,
    #[serde(default, rename = "override")]
    overrides: BTreeMap<String, Map<String, Value>>,
    #[serde(flatten)]
    config: Map<String, Value>,
}

impl LegacyProvisioner {
    fn max_retries(&self) -> Result<u32, Diagnostic> {
        let invalid = || Diagnostic::error("`max_retries` must be a valid integer").with_detail(format!("provisioner {}", self.ptype));
        match &self.max_retries {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()).ok_or_else(invalid),
            Some(Value::String(s)) if s.is_empty() => Ok(0),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid()),
            Some(_) => Err(invalid()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyPostProcessor {
    #[serde(rename = "type")]
    ptype: String,
    #[serde(default)]
    name: String,
    #[serde(flatten)]
    filter: OnlyExcept,
    #[serde(default)]
    keep_input_artifact: Option<bool>,
    #[serde(flatten)]
    config: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostProcessorStep {
    Type(String),
    Full(LegacyPostProcessor),
}

impl PostProcessorStep {
    fn into_post_processor(self) -> LegacyPostProcessor {
        match self {
            PostProcessorStep::Type(ptype) => LegacyPostProcessor {
                ptype,
                name: String::new(),
                filter: OnlyExcept::default(),
                keep_input_artifact: None,
                config: Map::new(),
            },
            PostProcessorStep::Full(pp) => pp,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostProcessorEntry {
    Chain(Vec<PostProcessorStep>),
    Step(PostProcessorStep),
}

/// Rewrites `{{user `x`}}`, `{{build_name}}`, `{{build_type}}` and
/// `{{build `X`}}` into `${...}` references. Anything else is left alone.
fn translate_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else { break };
        let inner = rest[start + 2..start + len].trim();
        let quoted = |prefix: &str| inner.strip_prefix(prefix).map(str::trim).and_then(|q| q.strip_prefix('`')?.strip_suffix('`'));
        let replacement = if let Some(name) = quoted("user") {
            Some(format!("${{var.{name}}}"))
        } else if let Some(key) = quoted("build ") {
            Some(format!("${{build.{key}}}"))
        } else {
            match inner {
                "build_name" => Some("${source.name}".to_string()),
                "build_type" => Some("${source.type}".to_string()),
                _ => None,
            }
        };
        out.push_str(&rest[..start]);
        match replacement {
            Some(r) => out.push_str(&r),
            None => out.push_str(&rest[start..start + len + 2]),
        }
        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);
    out
}

fn translate(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(translate_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(translate).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), translate(v))).collect()),
        other => other.clone(),
    }
}

fn translate_map(map: &Map<String, Value>) -> Value {
    translate(&Value::Object(map.clone()))
}

pub struct LegacyConfig {
    base_dir: PathBuf,
    template: LegacyTemplate,
    chains: Vec<Vec<LegacyPostProcessor>>,
    plugins: PluginContext,
    ctx: EvalContext,
}

impl LegacyConfig {
    pub fn load(path: &Path, plugins: PluginContext, inputs: &VarInputs) -> Result<(Self, Diagnostics), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut template: LegacyTemplate =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?;

        let chains = std::mem::take(&mut template.post_processors)
            .into_iter()
            .map(|entry| match entry {
                PostProcessorEntry::Chain(steps) => steps.into_iter().map(PostProcessorStep::into_post_processor).collect(),
                PostProcessorEntry::Step(step) => vec![step.into_post_processor()],
            })
            .collect();

        let sensitive: BTreeSet<&String> = template.sensitive_variables.iter().collect();
        let decls: BTreeMap<String, VariableDecl> = template
            .variables
            .iter()
            .map(|(name, default)| {
                let decl = VariableDecl {
                    default: (!default.is_null()).then(|| default.clone()),
                    sensitive: sensitive.contains(name),
                    description: String::new(),
                };
                (name.clone(), decl)
            })
            .collect();

        let mut ctx = EvalContext::new();
        let diags = evaluate_input_variables(&decls, inputs, &mut ctx, &plugins.secrets);
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        tracing::debug!(path = %path.display(), builders = template.builders.len(), "loaded legacy template");
        Ok((Self { base_dir, template, chains, plugins, ctx }, diags))
    }

    fn store(&self) -> &PluginStore {
        &self.plugins.plugins
    }

    fn builders_by_name(&self) -> Vec<&LegacyBuilder> {
        let mut builders: Vec<&LegacyBuilder> = self.template.builders.iter().collect();
        builders.sort_by(|a, b| a.build_name().cmp(b.build_name()));
        builders
    }

    fn start_provisioner(scope: &BuildScope<'_>, p: &LegacyProvisioner, build_name: &str, diags: &mut Diagnostics) -> Option<CoreBuildProvisioner> {
        let max_retries = match p.max_retries() {
            Ok(n) => n,
            Err(d) => {
                diags.push(d);
                return None;
            }
        };
        let config = match p.overrides.get(build_name) {
            Some(over) => merge_config(&p.config, over),
            None => p.config.clone(),
        };
        let settings = ProvisionerSettings {
            ptype: &p.ptype,
            name: "",
            pause_before: p.pause_before.as_deref(),
            timeout: p.timeout.as_deref(),
            max_retries,
        };
        let provisioner = scope.start_provisioner(&settings, &translate_map(&config), diags)?;
        Some(CoreBuildProvisioner { ptype: p.ptype.clone(), pname: String::new(), provisioner })
    }

    fn plan_build(&self, b: &LegacyBuilder, opts: &BuildOptions, diags: &mut Diagnostics) -> Option<CoreBuild> {
        let name = b.build_name().to_string();
        let source_ctx = self.ctx.with_source(&b.btype, &name);
        let config = match source_ctx.interpolate(&translate_map(&b.config)) {
            Ok(c) => c,
            Err(e) => {
                diags.push(Diagnostic::error("Build interpolation failure").with_detail(e.to_string()).with_subject(name));
                return None;
            }
        };

        let vars = builder_variables(&name, &b.btype, opts, &self.plugins.core_version);
        let (builder, generated) = start_builder(self.store(), &b.btype, &name, &vars, &config, diags)?;
        let scope = BuildScope { plugins: self.store(), vars: &vars, ctx: &source_ctx, build_name: &name, generated: &generated };

        let mut provisioners = Vec::new();
        for p in &self.template.provisioners {
            if p.filter.skip(&name) {
                continue;
            }
            provisioners.push(Self::start_provisioner(&scope, p, &name, diags)?);
        }
        let cleanup_provisioner = match &self.template.error_cleanup_provisioner {
            Some(p) if !p.filter.skip(&name) => Some(Self::start_provisioner(&scope, p, &name, diags)?),
            _ => None,
        };

        let mut post_processors = Vec::new();
        for chain in &self.chains {
            let mut steps = Vec::new();
            for pp in chain {
                if pp.filter.skip(&name) {
                    continue;
                }
                let display = if pp.name.is_empty() { &pp.ptype } else { &pp.name };
                let post_processor = scope.start_post_processor(&pp.ptype, display, &translate_map(&pp.config), diags)?;
                steps.push(CoreBuildPostProcessor {
                    ptype: pp.ptype.clone(),
                    pname: pp.name.clone(),
                    post_processor,
                    keep_input_artifact: pp.keep_input_artifact,
                });
            }
            if !steps.is_empty() {
                post_processors.push(steps);
            }
        }

        Some(CoreBuild {
            build_name: String::new(),
            kind: name,
            builder_type: b.btype.clone(),
            builder,
            provisioners,
            cleanup_provisioner,
            post_processors,
            debug: opts.debug,
            force: opts.force,
            on_error: opts.on_error,
        })
    }
}

impl ConfigHandler for LegacyConfig {
    fn evaluate_datasources(&mut self, _skip_execution: bool) -> Diagnostics {
        Diagnostics::new()
    }

    fn evaluate_variables(&mut self) -> Diagnostics {
        Diagnostics::new()
    }

    fn evaluate_builds(&mut self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let store = self.store();
        let mut seen = BTreeSet::new();
        for (i, b) in self.template.builders.iter().enumerate() {
            if !store.builders.has(&b.btype) {
                diags.push(
                    Diagnostic::error(format!("Unknown builder type {:?}", b.btype))
                        .with_detail(format!("known builders: {:?}", store.builders.list())),
                );
            }
            if !seen.insert(b.build_name()) {
                diags.push(Diagnostic::error(format!("builder {i}: builder with name {:?} already exists", b.build_name())));
            }
        }
        for p in self.template.provisioners.iter().chain(self.template.error_cleanup_provisioner.as_ref()) {
            if !store.provisioners.has(&p.ptype) {
                diags.push(Diagnostic::error(format!("Unknown provisioner type {:?}", p.ptype)));
            }
            if let Err(d) = p.max_retries() {
                diags.push(d);
            }
        }
        for pp in self.chains.iter().flatten() {
            if !store.post_processors.has(&pp.ptype) {
                diags.push(Diagnostic::error(format!("Unknown post-processor type {:?}", pp.ptype)));
            }
        }
        diags
    }

    fn get_builds(&mut self, opts: &BuildOptions) -> (Vec<CoreBuild>, Diagnostics) {
        let mut diags = Diagnostics::new();
        let filter = BuildFilter::exact(&opts.only, &opts.except);
        let mut tally = FilterTally::default();
        let mut builds = Vec::new();
        for b in self.builders_by_name() {
            if tally.skip_build(&filter, b.build_name()) {
                continue;
            }
            if let Some(build) = self.plan_build(b, opts, &mut diags) {
                builds.push(build);
            }
        }
        diags.append(tally.warnings(&filter));
        (builds, diags)
    }

    fn registry_setup(&self) -> RegistrySetup {
        RegistrySetup {
            template_type: TemplateType::Legacy,
            template_dir: self.base_dir.clone(),
            build_blocks: 1,
            registry_blocks: Vec::new(),
            build_name: String::new(),
            build_description: self.template.description.clone(),
            components: self.builders_by_name().iter().map(|b| b.build_name().to_string()).collect(),
            parent_versions: BTreeMap::new(),
        }
    }

    fn inspect(&self) -> Inspection {
        let sensitive: BTreeSet<&String> = self.template.sensitive_variables.iter().collect();
        let variables = self
            .template
            .variables
            .keys()
            .map(|name| {
                let shown = match self.ctx.var(name) {
                    _ if sensitive.contains(name) => REDACTED.to_string(),
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => "<unset>".to_string(),
                };
                (name.clone(), shown)
            })
            .collect();
        let sources: Vec<String> = self.builders_by_name().iter().map(|b| b.build_name().to_string()).collect();
        let build = InspectedBuild {
            name: String::new(),
            sources: sources.clone(),
            provisioners: self.template.provisioners.iter().map(|p| p.ptype.clone()).collect(),
            post_processors: self
                .chains
                .iter()
                .map(|chain| chain.iter().map(|pp| if pp.name.is_empty() { pp.ptype.clone() } else { pp.name.clone() }).collect())
                .collect(),
        };
        Inspection { variables, sources, builds: vec![build] }
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn translates_legacy_placeholders() {
        assert_eq!(translate_str("{{user `region`}}-ami"), "${var.region}-ami");
        assert_eq!(translate_str("{{ build_name }}/{{build_type}}"), "${source.name}/${source.type}");
        assert_eq!(translate_str("{{build `ID`}}"), "${build.ID}");
        assert_eq!(translate_str("{{timestamp}} {{"), "{{timestamp}} {{");
    }

    #[test]
    fn post_processor_shapes() {
        let raw = json!({
            "builders": [{"type": "null"}],
            "post-processors": ["manifest", {"type": "checksum", "keep_input_artifact": true}, ["checksum", {"type": "manifest", "name": "m"}]]
        });
        let t: LegacyTemplate = serde_json::from_value(raw).unwrap();
        let shapes: Vec<usize> = t
            .post_processors
            .iter()
            .map(|e| match e {
                PostProcessorEntry::Chain(c) => c.len(),
                PostProcessorEntry::Step(_) => 1,
            })
            .collect();
        assert_eq!(shapes, vec![1, 1, 2]);
    }

    #[test]
    fn max_retries_accepts_numbers_and_numeric_strings() {
        let p = |v: Value| -> LegacyProvisioner { serde_json::from_value(json!({"type": "shell-local", "max_retries": v})).unwrap() };
        assert_eq!(p(json!(3)).max_retries().unwrap(), 3);
        assert_eq!(p(json!("5")).max_retries().unwrap(), 5);
        assert_eq!(p(json!("")).max_retries().unwrap(), 0);
        assert_eq!(p(json!("many")).max_retries().unwrap_err().summary, "`max_retries` must be a valid integer");
    }
}
