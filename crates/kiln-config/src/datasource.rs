use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kiln_core::{ConfigValue, Diagnostic, Diagnostics, PluginStore, UNKNOWN_VALUE};
use serde_json::Value;

use crate::eval::{references, EvalContext, DATA_ROOT};

/// Deepest chain of datasource dependencies followed before giving up.
pub const MAX_DATASOURCE_DEPTH: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasourceRef {
    pub kind: String,
    pub name: String,
}

impl fmt::Display for DatasourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data.{}.{}", self.kind, self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatasourceBlock {
    pub kind: String,
    pub name: String,
    pub body: ConfigValue,
}

impl DatasourceBlock {
    pub fn reference(&self) -> DatasourceRef {
        DatasourceRef { kind: self.kind.clone(), name: self.name.clone() }
    }

    pub fn dependencies(&self) -> Vec<DatasourceRef> {
        let mut deps: Vec<DatasourceRef> = references(&self.body)
            .into_iter()
            .filter(|r| r.root() == DATA_ROOT && r.path.len() >= 3)
            .map(|r| DatasourceRef { kind: r.path[1].clone(), name: r.path[2].clone() })
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Same shape as `spec` with every leaf replaced by the unknown placeholder.
pub fn placeholder_value(spec: &Value) -> Value {
    match spec {
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), placeholder_value(v))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(placeholder_value).collect()),
        _ => Value::String(UNKNOWN_VALUE.to_string()),
    }
}

fn depth_exceeded() -> Diagnostic {
    Diagnostic::error("Max datasource recursion depth exceeded.").with_detail(
        "An error occured while recursively evaluating data sources. Either your data source depends on more than ten \
         other data sources, or your data sources have a cyclic dependency. Please simplify your config to continue.",
    )
}

struct Resolver<'a> {
    blocks: BTreeMap<DatasourceRef, &'a DatasourceBlock>,
    pending: BTreeMap<DatasourceRef, Vec<DatasourceRef>>,
    failed: BTreeSet<DatasourceRef>,
    plugins: &'a PluginStore,
    ctx: &'a mut EvalContext,
    skip_execution: bool,
    diags: Diagnostics,
}

impl Resolver<'_> {
    fn evaluate(&mut self, r: &DatasourceRef) -> bool {
        if self.failed.contains(r) {
            return false;
        }
        let Some(block) = self.blocks.get(r).copied() else {
            return false;
        };
        match self.execute(block) {
            Ok(value) => {
                tracing::debug!(datasource = %r, "datasource evaluated");
                self.ctx.set_data(&block.kind, &block.name, value);
                true
            }
            Err(diag) => {
                self.diags.push(diag.with_subject(r.to_string()));
                self.failed.insert(r.clone());
                false
            }
        }
    }

    fn execute(&self, block: &DatasourceBlock) -> Result<Value, Diagnostic> {
        let mut ds = self.plugins.datasources.start(&block.kind).map_err(|_| {
            Diagnostic::error(format!("Unknown data source type {:?}", block.kind))
                .with_detail(format!("known data sources: {:?}", self.plugins.datasources.list()))
        })?;
        let config = self.ctx.interpolate(&block.body).map_err(|e| Diagnostic::error(e.to_string()))?;
        ds.configure(&config).map_err(|e| Diagnostic::error(format!("Failed to configure data source {}", block.kind)).with_detail(format!("{e:#}")))?;
        if self.skip_execution {
            return Ok(placeholder_value(&ds.output_spec()));
        }
        ds.execute().map_err(|e| Diagnostic::error(format!("{e:#}")))
    }

    /// Depth-first: every pending dependency of `r` first, then `r` itself.
    /// `depth` grows with every dependency followed, including siblings.
    fn resolve_recursive(&mut self, r: &DatasourceRef, mut depth: usize) -> bool {
        if depth > MAX_DATASOURCE_DEPTH {
            self.diags.push(depth_exceeded());
            return false;
        }
        let deps = self.pending.get(r).cloned().unwrap_or_default();
        for dep in &deps {
            if self.pending.contains_key(dep) {
                depth += 1;
                if !self.resolve_recursive(dep, depth) {
                    return false;
                }
            }
        }
        if !self.evaluate(r) {
            return false;
        }
        self.pending.remove(r);
        true
    }
}

/// Evaluates every datasource into `ctx.data`, ordering them so that a
/// datasource runs after the ones it refers to. Failures are reported per
/// datasource and do not stop independent ones.
///
/// With `skip_execution`, datasources are configured but not executed; each
/// gets a placeholder shaped like its output.
pub fn resolve_datasources(blocks: &[DatasourceBlock], plugins: &PluginStore, ctx: &mut EvalContext, skip_execution: bool) -> Diagnostics {
    let mut resolver = Resolver {
        blocks: blocks.iter().map(|b| (b.reference(), b)).collect(),
        pending: BTreeMap::new(),
        failed: BTreeSet::new(),
        plugins,
        ctx,
        skip_execution,
        diags: Diagnostics::new(),
    };

    // Leaves are pending too, with no dependencies, so they count as a level.
    resolver.pending = resolver.blocks.iter().map(|(r, b)| (r.clone(), b.dependencies())).collect();

    let refs: Vec<DatasourceRef> = resolver.pending.keys().cloned().collect();
    for r in &refs {
        if resolver.pending.contains_key(r) {
            resolver.resolve_recursive(r, 0);
        }
    }

    resolver.diags.dedup_by_summary()
}
