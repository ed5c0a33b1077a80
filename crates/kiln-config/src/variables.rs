use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_core::{Diagnostic, Diagnostics, SecretFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::eval::EvalContext;

/// Rounds of local evaluation before giving up.
pub const MAX_LOCALS_ROUNDS: usize = 10;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub description: String,
}

/// Values supplied from outside the template: `-var-file` paths in order,
/// then `-var key=value` pairs.
#[derive(Clone, Debug, Default)]
pub struct VarInputs {
    pub files: Vec<PathBuf>,
    pub overrides: Vec<(String, String)>,
}

impl VarInputs {
    pub fn parse_overrides(raw: &[String]) -> Result<Vec<(String, String)>, Diagnostic> {
        raw.iter()
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
                _ => Err(Diagnostic::error(format!("Invalid -var {kv:?}")).with_detail("Expected a variable assignment like -var region=eu-west-1.")),
            })
            .collect()
    }
}

/// Reads a variable file. The format follows the extension: `.toml`, `.json`,
/// `.yaml` or `.yml`.
pub fn load_var_file(path: &Path) -> Result<BTreeMap<String, Value>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let parse_err = |message: String| ConfigError::Parse { path: path.to_path_buf(), message };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    match ext {
        "toml" => toml::from_str(&raw).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(&raw).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|e| parse_err(e.to_string())),
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn secret_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn typed_override(raw: &str, default: Option<&Value>) -> Value {
    match default {
        Some(Value::String(_)) | None => Value::String(raw.to_string()),
        Some(_) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

/// Resolves input variables into `ctx`: defaults, then variable files, then
/// command line overrides. Sensitive values are registered with `secrets`.
pub fn evaluate_input_variables(
    decls: &BTreeMap<String, VariableDecl>,
    inputs: &VarInputs,
    ctx: &mut EvalContext,
    secrets: &SecretFilter,
) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let mut values: BTreeMap<String, Value> = decls.iter().filter_map(|(k, d)| d.default.clone().map(|v| (k.clone(), v))).collect();

    for file in &inputs.files {
        match load_var_file(file) {
            Ok(file_values) => {
                for (name, value) in file_values {
                    if !decls.contains_key(&name) {
                        diags.push(
                            Diagnostic::warning("Undefined variable")
                                .with_detail(format!("A {name:?} variable was set but was not declared in the template."))
                                .with_subject(file.display().to_string()),
                        );
                        continue;
                    }
                    values.insert(name, value);
                }
            }
            Err(e) => diags.push(e.to_diagnostic()),
        }
    }

    for (name, raw) in &inputs.overrides {
        let Some(decl) = decls.get(name) else {
            diags.push(
                Diagnostic::error("Undefined -var variable")
                    .with_detail(format!("A {name:?} variable was passed in but was not declared in the template.")),
            );
            continue;
        };
        values.insert(name.clone(), typed_override(raw, decl.default.as_ref()));
    }

    for (name, decl) in decls {
        match values.remove(name) {
            Some(value) => {
                if decl.sensitive {
                    secrets.add(secret_text(&value));
                }
                ctx.set_var(name.clone(), value);
            }
            None => diags.push(
                Diagnostic::error(format!("Unset variable {name:?}"))
                    .with_detail("A used variable must be set or have a default value; pass it with -var or -var-file."),
            ),
        }
    }
    diags
}

/// Evaluates locals into `ctx`. Locals may refer to each other in any order;
/// each round evaluates what it can until nothing changes.
pub fn evaluate_locals(locals: &BTreeMap<String, Value>, ctx: &mut EvalContext) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let mut pending: Vec<(&String, &Value)> = locals.iter().collect();

    for _ in 0..MAX_LOCALS_ROUNDS {
        if pending.is_empty() {
            return diags;
        }
        let before = pending.len();
        let mut failed = Vec::new();
        let mut errors = Diagnostics::new();
        for (name, expr) in pending {
            match ctx.interpolate(expr) {
                Ok(value) => ctx.set_local(name.clone(), value),
                Err(e) => {
                    failed.push((name, expr));
                    errors.push(e.to_diagnostic(format!("local.{name}")));
                }
            }
        }
        if failed.len() == before {
            diags.append(errors);
            return diags;
        }
        pending = failed;
    }

    if !pending.is_empty() {
        diags.push(Diagnostic::error("Max local evaluation rounds exceeded").with_detail(format!(
            "Locals could not be evaluated within {MAX_LOCALS_ROUNDS} rounds. Either a local depends on a long chain of other \
             locals, or locals depend on each other cyclically. Please simplify your config to continue."
        )));
    }
    diags
}
