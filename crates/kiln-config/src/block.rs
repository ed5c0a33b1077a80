use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kiln_core::{Diagnostic, Diagnostics, PluginContext, PluginStore, REDACTED};
use kiln_registry::{ParentVersion, TemplateType};
use serde_json::{Map, Value};

use crate::core_build::{build_unit_name, CoreBuild, CoreBuildPostProcessor, CoreBuildProvisioner};
use crate::datasource::{resolve_datasources, DatasourceBlock};
use crate::error::ConfigError;
use crate::eval::EvalContext;
use crate::filter::{BuildFilter, FilterTally};
use crate::handler::{BuildOptions, ConfigHandler, InspectedBuild, Inspection, RegistrySetup};
use crate::plan::{builder_variables, merge_config, start_builder, BuildScope, ProvisionerSettings};
use crate::suggest::name_suggestion;
use crate::template::{BlockTemplate, BuildBlock, ProvisionerBlock, SourceRef, SourceUse};
use crate::variables::{evaluate_input_variables, evaluate_locals, VarInputs};

pub const REGISTRY_IMAGE_DATASOURCE: &str = "registry-image";
pub const REGISTRY_VERSION_DATASOURCE: &str = "registry-version";

struct Planning<'a> {
    opts: &'a BuildOptions,
    filter: BuildFilter,
    tally: FilterTally,
    diags: Diagnostics,
}

/// Block templates: one `*.kiln.toml` file or a directory of them.
pub struct BlockConfig {
    base_dir: PathBuf,
    template: BlockTemplate,
    plugins: PluginContext,
    ctx: EvalContext,
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn unknown_type(kind: &str, given: &str, known: &[String]) -> Diagnostic {
    let diag = Diagnostic::error(format!("Unknown {kind} type {given:?}"));
    match name_suggestion(given, known) {
        Some(s) => diag.with_detail(format!("Did you mean to use {s:?}?")),
        None => diag.with_detail(format!("known {kind}s: {known:?}")),
    }
}

impl BlockConfig {
    pub fn load(path: &Path, plugins: PluginContext, inputs: &VarInputs) -> Result<(Self, Diagnostics), ConfigError> {
        let template = BlockTemplate::load(path)?;
        let base_dir = if path.is_dir() { path.to_path_buf() } else { path.parent().map(Path::to_path_buf).unwrap_or_default() };

        let mut ctx = EvalContext::new();
        let diags = evaluate_input_variables(&template.variables, inputs, &mut ctx, &plugins.secrets);
        tracing::debug!(path = %path.display(), builds = template.build.len(), "loaded block template");
        Ok((Self { base_dir, template, plugins, ctx }, diags))
    }

    pub fn template(&self) -> &BlockTemplate {
        &self.template
    }

    pub fn eval_context(&self) -> &EvalContext {
        &self.ctx
    }

    fn store(&self) -> &PluginStore {
        &self.plugins.plugins
    }

    fn datasource_blocks(&self) -> Vec<DatasourceBlock> {
        self.template
            .data
            .iter()
            .flat_map(|(kind, by_name)| {
                by_name.iter().map(move |(name, body)| DatasourceBlock { kind: kind.clone(), name: name.clone(), body: body.clone() })
            })
            .collect()
    }

    fn check_source(&self, usage: &SourceUse, diags: &mut Diagnostics) {
        let raw = usage.raw_ref();
        let Some(src) = SourceRef::parse(raw) else {
            diags.push(
                Diagnostic::error(format!("Invalid source reference {raw:?}"))
                    .with_detail("A source is referenced as source.<type>.<name> or <type>.<name>."),
            );
            return;
        };
        if !self.store().builders.has(&src.kind) {
            diags.push(
                Diagnostic::error(format!("Unknown source type {}", src.kind))
                    .with_detail(format!("known builders: {:?}", self.store().builders.list())),
            );
            return;
        }
        if self.template.source_body(&src).is_none() {
            let known: Vec<String> = self.template.source_refs().iter().map(ToString::to_string).collect();
            let detail = match name_suggestion(&src.to_string(), &known) {
                Some(s) => format!("Did you mean to use {s:?}?"),
                None => format!("Known: {known:?}"),
            };
            diags.push(Diagnostic::error(format!("Unknown source {src}")).with_detail(detail));
        }
    }

    fn check_build(&self, block: &BuildBlock, diags: &mut Diagnostics) {
        for usage in &block.sources {
            self.check_source(usage, diags);
        }
        let store = self.store();
        for p in &block.provisioner {
            if !store.provisioners.has(&p.ptype) {
                diags.push(unknown_type("provisioner", &p.ptype, &store.provisioners.list()));
            }
        }
        if let Some(p) = &block.error_cleanup_provisioner {
            if !store.provisioners.has(&p.ptype) {
                diags.push(unknown_type("error-cleanup-provisioner", &p.ptype, &store.provisioners.list()));
            }
        }
        for chain in block.post_processor_chains() {
            for pp in chain {
                if !store.post_processors.has(&pp.ptype) {
                    diags.push(unknown_type("post-processor", &pp.ptype, &store.post_processors.list()));
                }
            }
        }
    }

    fn start_provisioner_block(
        scope: &BuildScope<'_>,
        p: &ProvisionerBlock,
        kind: &str,
        local_name: &str,
        diags: &mut Diagnostics,
    ) -> Option<CoreBuildProvisioner> {
        let body = match p.overrides.get(kind).or_else(|| p.overrides.get(local_name)) {
            Some(over) => merge_config(&p.config, over),
            None => p.config.clone(),
        };
        let settings = ProvisionerSettings {
            ptype: &p.ptype,
            name: &p.name,
            pause_before: p.pause_before.as_deref(),
            timeout: p.timeout.as_deref(),
            max_retries: p.max_retries,
        };
        let provisioner = scope.start_provisioner(&settings, &Value::Object(body), diags)?;
        Some(CoreBuildProvisioner { ptype: p.ptype.clone(), pname: p.name.clone(), provisioner })
    }

    fn plan_build(&self, block: &BuildBlock, src: &SourceRef, usage: &SourceUse, plan: &mut Planning<'_>) -> Option<CoreBuild> {
        let opts = plan.opts;
        let diags = &mut plan.diags;
        let body = self.template.source_body(src)?;
        let local_name = usage.local_name().unwrap_or(&src.name);
        let kind = format!("{}.{local_name}", src.kind);
        let name = build_unit_name(&block.name, &kind);

        let empty = Map::new();
        let merged = merge_config(body, usage.config().unwrap_or(&empty));
        let source_ctx = self.ctx.with_source(&src.kind, local_name);
        let config = match source_ctx.interpolate(&Value::Object(merged)) {
            Ok(c) => c,
            Err(e) => {
                diags.push(e.to_diagnostic(format!("source.{kind}")));
                return None;
            }
        };

        let vars = builder_variables(&name, &src.kind, opts, &self.plugins.core_version);
        let (builder, generated) = start_builder(self.store(), &src.kind, &kind, &vars, &config, diags)?;
        let scope = BuildScope { plugins: self.store(), vars: &vars, ctx: &source_ctx, build_name: &name, generated: &generated };

        let mut provisioners = Vec::new();
        for p in &block.provisioner {
            if p.filter.skip(&kind) {
                tracing::debug!(build = %name, provisioner = %p.display_name(), "provisioner skipped by only/except");
                continue;
            }
            provisioners.push(Self::start_provisioner_block(&scope, p, &kind, local_name, diags)?);
        }

        let cleanup_provisioner = match &block.error_cleanup_provisioner {
            Some(p) if !p.filter.skip(&kind) => Some(Self::start_provisioner_block(&scope, p, &kind, local_name, diags)?),
            _ => None,
        };

        let mut post_processors = Vec::new();
        for chain in block.post_processor_chains() {
            let mut steps = Vec::new();
            for pp in chain {
                if pp.filter.skip(&kind) {
                    continue;
                }
                if plan.filter.matches_except(pp.display_name()) {
                    plan.tally.except_matches += 1;
                    break;
                }
                let post_processor = scope.start_post_processor(&pp.ptype, pp.display_name(), &Value::Object(pp.config.clone()), diags)?;
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
            build_name: block.name.clone(),
            kind,
            builder_type: src.kind.clone(),
            builder,
            provisioners,
            cleanup_provisioner,
            post_processors,
            debug: opts.debug,
            force: opts.force,
            on_error: opts.on_error,
        })
    }

    fn component_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for block in &self.template.build {
            for usage in &block.sources {
                let Some(src) = SourceRef::parse(usage.raw_ref()) else { continue };
                let local_name = usage.local_name().unwrap_or(&src.name);
                names.push(build_unit_name(&block.name, &format!("{}.{local_name}", src.kind)));
            }
        }
        names
    }

    fn parent_versions(&self) -> BTreeMap<String, ParentVersion> {
        let versions = self.ctx.data_of_type(REGISTRY_VERSION_DATASOURCE);
        let Some(images) = self.ctx.data_of_type(REGISTRY_IMAGE_DATASOURCE) else {
            return BTreeMap::new();
        };
        let mut parents = BTreeMap::new();
        for image in images.values() {
            let version_id = str_field(image, "version_id");
            let mut channel_id = str_field(image, "channel_id");
            if channel_id.is_empty() {
                if let Some(v) = versions.and_then(|vs| vs.values().find(|v| str_field(v, "id") == version_id)) {
                    channel_id = str_field(v, "channel_id");
                }
            }
            parents.insert(
                str_field(image, "id").to_string(),
                ParentVersion { version_id: version_id.to_string(), channel_id: channel_id.to_string() },
            );
        }
        parents
    }
}

impl ConfigHandler for BlockConfig {
    fn evaluate_datasources(&mut self, skip_execution: bool) -> Diagnostics {
        let blocks = self.datasource_blocks();
        let plugins = self.plugins.plugins.clone();
        resolve_datasources(&blocks, &plugins, &mut self.ctx, skip_execution)
    }

    fn evaluate_variables(&mut self) -> Diagnostics {
        evaluate_locals(&self.template.locals, &mut self.ctx)
    }

    fn evaluate_builds(&mut self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for block in &self.template.build {
            self.check_build(block, &mut diags);
        }
        diags
    }

    fn get_builds(&mut self, opts: &BuildOptions) -> (Vec<CoreBuild>, Diagnostics) {
        let mut diags = Diagnostics::new();
        if self.template.build.iter().all(|b| b.sources.is_empty()) {
            diags.push(
                Diagnostic::error("Missing build block")
                    .with_detail("A build block with one or more sources is required for executing a build."),
            );
            return (Vec::new(), diags);
        }
        let filter = match BuildFilter::glob(&opts.only, &opts.except) {
            Ok(f) => f,
            Err(d) => return (Vec::new(), d),
        };

        let mut plan = Planning { opts, filter, tally: FilterTally::default(), diags };
        let mut seen = BTreeSet::new();
        let mut builds = Vec::new();
        for block in &self.template.build {
            for usage in &block.sources {
                // invalid references were reported while evaluating builds
                let Some(src) = SourceRef::parse(usage.raw_ref()) else { continue };
                if self.template.source_body(&src).is_none() {
                    continue;
                }
                let local_name = usage.local_name().unwrap_or(&src.name);
                let name = build_unit_name(&block.name, &format!("{}.{local_name}", src.kind));
                if plan.tally.skip_build(&plan.filter, &name) {
                    tracing::debug!(build = %name, "build skipped by -only/-except");
                    continue;
                }
                if !seen.insert(name.clone()) {
                    plan.diags.push(
                        Diagnostic::error("Duplicate build name")
                            .with_detail(format!("Build name {name:?} is used by more than one source; give one of them a distinct name."))
                            .with_subject(name.clone()),
                    );
                }
                if let Some(build) = self.plan_build(block, &src, usage, &mut plan) {
                    builds.push(build);
                }
            }
        }
        let warnings = plan.tally.warnings(&plan.filter);
        plan.diags.append(warnings);
        (builds, plan.diags)
    }

    fn registry_setup(&self) -> RegistrySetup {
        let configured = self.template.build.iter().find(|b| b.registry.is_some()).or(self.template.build.first());
        RegistrySetup {
            template_type: TemplateType::Block,
            template_dir: self.base_dir.clone(),
            build_blocks: self.template.build.len(),
            registry_blocks: self.template.build.iter().filter_map(|b| b.registry.clone()).collect(),
            build_name: configured.map(|b| b.name.clone()).unwrap_or_default(),
            build_description: configured.map(|b| b.description.clone()).unwrap_or_default(),
            components: self.component_names(),
            parent_versions: self.parent_versions(),
        }
    }

    fn inspect(&self) -> Inspection {
        let variables = self
            .template
            .variables
            .iter()
            .map(|(name, decl)| {
                let shown = match self.ctx.var(name) {
                    _ if decl.sensitive => REDACTED.to_string(),
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => v.to_string(),
                    None => "<unset>".to_string(),
                };
                (name.clone(), shown)
            })
            .collect();
        let builds = self
            .template
            .build
            .iter()
            .map(|b| InspectedBuild {
                name: b.name.clone(),
                sources: b.sources.iter().map(|s| s.raw_ref().to_string()).collect(),
                provisioners: b.provisioner.iter().map(|p| p.display_name().to_string()).collect(),
                post_processors: b
                    .post_processor_chains()
                    .iter()
                    .map(|chain| chain.iter().map(|pp| pp.display_name().to_string()).collect())
                    .collect(),
            })
            .collect();
        Inspection { variables, sources: self.template.source_refs().iter().map(ToString::to_string).collect(), builds }
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
