use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{
    Builder, BuilderVariables, CancelToken, ConfigValue, Diagnostic, Diagnostics, GeneratedData, PluginStore, PostProcessor,
    Provisioner, SharedUi, BUILDER_DATA_COMMON_KEYS, BUILDER_TYPE_VAR, BUILD_NAME_VAR, CORE_VERSION_VAR, DEBUG_VAR, FORCE_VAR,
    ON_ERROR_VAR, UNKNOWN_VALUE,
};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::duration::parse_duration;
use crate::eval::{references, EvalContext, BUILD_ROOT};
use crate::handler::BuildOptions;
use crate::policy::{PolicyProvisioner, ProvisionerPolicy};

/// Variables handed to every component of a build at prepare time.
pub fn builder_variables(build_name: &str, builder_type: &str, opts: &BuildOptions, core_version: &str) -> BuilderVariables {
    BuilderVariables::from([
        (BUILD_NAME_VAR.to_string(), build_name.to_string()),
        (BUILDER_TYPE_VAR.to_string(), builder_type.to_string()),
        (CORE_VERSION_VAR.to_string(), core_version.to_string()),
        (DEBUG_VAR.to_string(), opts.debug.to_string()),
        (FORCE_VAR.to_string(), opts.force.to_string()),
        (ON_ERROR_VAR.to_string(), opts.on_error.to_string()),
    ])
}

/// `build.*` values before the builder has run: every key a builder may
/// generate maps to the unknown placeholder.
pub fn unknown_build_values(generated: &[String], build_name: &str) -> Map<String, Value> {
    let mut values: Map<String, Value> = BUILDER_DATA_COMMON_KEYS
        .iter()
        .map(|k| (k.to_string(), Value::String(UNKNOWN_VALUE.to_string())))
        .collect();
    for k in generated {
        values.insert(k.clone(), Value::String(UNKNOWN_VALUE.to_string()));
    }
    values.insert("name".into(), Value::String(build_name.to_string()));
    values
}

pub fn generated_build_values(data: &GeneratedData, build_name: &str) -> Map<String, Value> {
    let mut values: Map<String, Value> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    values.insert("name".into(), Value::String(build_name.to_string()));
    values
}

pub fn merge_config(base: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn refers_to_build(body: &Value) -> bool {
    references(body).iter().any(|r| r.root() == BUILD_ROOT)
}

/// A provisioner whose configuration refers to `build.*`. It is prepared with
/// placeholders while planning and prepared again with the builder's real
/// values right before it runs.
pub struct TemplatedProvisioner {
    inner: Mutex<Box<dyn Provisioner>>,
    vars: BuilderVariables,
    body: Value,
    ctx: EvalContext,
    build_name: String,
}

#[async_trait]
impl Provisioner for TemplatedProvisioner {
    fn prepare(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        self.inner.get_mut().prepare(vars, config)
    }

    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if !data.is_empty() {
            let ctx = self.ctx.with_build(generated_build_values(data, &self.build_name));
            let config = ctx.interpolate(&self.body)?;
            inner.prepare(&self.vars, &config)?;
        }
        inner.provision(cancel, ui, data).await
    }
}

pub struct ProvisionerSettings<'a> {
    pub ptype: &'a str,
    pub name: &'a str,
    pub pause_before: Option<&'a str>,
    pub timeout: Option<&'a str>,
    pub max_retries: u32,
}

impl ProvisionerSettings<'_> {
    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.ptype
        } else {
            self.name
        }
    }

    pub fn policy(&self) -> Result<ProvisionerPolicy, Diagnostic> {
        let parse = |field: &str, raw: Option<&str>| -> Result<Duration, Diagnostic> {
            match raw {
                None | Some("") => Ok(Duration::ZERO),
                Some(raw) => parse_duration(raw).map_err(|e| {
                    Diagnostic::error(format!("Failed preparing {}", self.display_name())).with_detail(format!("invalid {field}: {e}"))
                }),
            }
        };
        Ok(ProvisionerPolicy {
            pause_before: parse("pause_before", self.pause_before)?,
            timeout: parse("timeout", self.timeout)?,
            max_retries: self.max_retries,
        })
    }
}

/// Starts and prepares a builder. Returns it with the extra keys it will
/// generate.
pub fn start_builder(
    plugins: &PluginStore,
    builder_type: &str,
    source: &str,
    vars: &BuilderVariables,
    config: &ConfigValue,
    diags: &mut Diagnostics,
) -> Option<(Box<dyn Builder>, Vec<String>)> {
    let mut builder = match plugins.builders.start(builder_type) {
        Ok(b) => b,
        Err(e) => {
            diags.push(Diagnostic::error("Failed to load source type").with_detail(e.to_string()).with_subject(source));
            return None;
        }
    };
    match builder.prepare(vars, config) {
        Ok(prepared) => {
            for w in prepared.warnings {
                diags.push(Diagnostic::warning(format!("Warning when preparing build: {source}")).with_detail(w));
            }
            Some((builder, prepared.generated_vars))
        }
        Err(e) => {
            diags.push(Diagnostic::error(format!("Failed preparing {source}")).with_detail(format!("{e:#}")).with_subject(source));
            None
        }
    }
}

/// What the components of one build are prepared against.
pub struct BuildScope<'a> {
    pub plugins: &'a PluginStore,
    pub vars: &'a BuilderVariables,
    pub ctx: &'a EvalContext,
    pub build_name: &'a str,
    pub generated: &'a [String],
}

impl BuildScope<'_> {
    /// Starts, interpolates and prepares a provisioner, then applies its
    /// pause/timeout/retry settings.
    pub fn start_provisioner(&self, settings: &ProvisionerSettings<'_>, body: &Value, diags: &mut Diagnostics) -> Option<Box<dyn Provisioner>> {
        let policy = match settings.policy() {
            Ok(p) => p,
            Err(d) => {
                diags.push(d);
                return None;
            }
        };
        let mut provisioner = match self.plugins.provisioners.start(settings.ptype) {
            Ok(p) => p,
            Err(e) => {
                diags.push(Diagnostic::error(format!("failed loading {}", settings.ptype)).with_detail(e.to_string()));
                return None;
            }
        };

        let planning_ctx = self.ctx.with_build(unknown_build_values(self.generated, self.build_name));
        let prepared = planning_ctx
            .interpolate(body)
            .map_err(anyhow::Error::from)
            .and_then(|config| provisioner.prepare(self.vars, &config));
        if let Err(e) = prepared {
            diags.push(Diagnostic::error(format!("Failed preparing {}", settings.display_name())).with_detail(format!("{e:#}")));
            return None;
        }

        if refers_to_build(body) {
            provisioner = Box::new(TemplatedProvisioner {
                inner: Mutex::new(provisioner),
                vars: self.vars.clone(),
                body: body.clone(),
                ctx: self.ctx.clone(),
                build_name: self.build_name.to_string(),
            });
        }
        Some(PolicyProvisioner::wrap(provisioner, policy))
    }

    pub fn start_post_processor(&self, ptype: &str, display_name: &str, body: &Value, diags: &mut Diagnostics) -> Option<Box<dyn PostProcessor>> {
        let mut pp = match self.plugins.post_processors.start(ptype) {
            Ok(pp) => pp,
            Err(e) => {
                diags.push(Diagnostic::error(format!("Failed loading {ptype}")).with_detail(e.to_string()));
                return None;
            }
        };
        let ctx = self.ctx.with_build(unknown_build_values(self.generated, self.build_name));
        let configured = ctx.interpolate(body).map_err(anyhow::Error::from).and_then(|config| pp.configure(self.vars, &config));
        if let Err(e) = configured {
            diags.push(Diagnostic::error(format!("Failed preparing {display_name}")).with_detail(format!("{e:#}")));
            return None;
        }
        Some(pp)
    }
}
