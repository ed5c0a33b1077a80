use std::collections::BTreeMap;
use std::fmt;

use kiln_core::UNKNOWN_VALUE;
use serde_json::{Map, Value};

use crate::error::EvalError;

pub const VAR_ROOT: &str = "var";
pub const LOCAL_ROOT: &str = "local";
pub const DATA_ROOT: &str = "data";
pub const SOURCE_ROOT: &str = "source";
pub const BUILD_ROOT: &str = "build";

/// A dotted path inside `${...}`, e.g. `data.static.base.value` or `var.tags[0]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(expr: &str) -> Result<Self, EvalError> {
        let normalized = expr.trim().replace('[', ".").replace(']', "");
        let path: Vec<String> = normalized.split('.').map(str::to_string).collect();
        let valid = |seg: &String| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if path.len() < 2 || !path.iter().all(valid) {
            return Err(EvalError::InvalidReference(expr.trim().to_string()));
        }
        Ok(Self { path })
    }

    pub fn root(&self) -> &str {
        &self.path[0]
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.join("."))
    }
}

enum Segment<'a> {
    Text(String),
    Expr(&'a str),
}

fn segments(s: &str) -> Result<Vec<Segment<'_>>, EvalError> {
    let mut out = Vec::new();
    let mut text = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        if start > 0 && rest[..start].ends_with('$') {
            text.push_str(&rest[..start - 1]);
            text.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| EvalError::Unterminated(s.to_string()))?;
        if !text.is_empty() {
            out.push(Segment::Text(std::mem::take(&mut text)));
        }
        out.push(Segment::Expr(&after[..end]));
        rest = &after[end + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        out.push(Segment::Text(text));
    }
    Ok(out)
}

pub fn references(value: &Value) -> Vec<Reference> {
    let mut out = Vec::new();
    collect_references(value, &mut out);
    out
}

fn collect_references(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => {
            if let Ok(segs) = segments(s) {
                for seg in segs {
                    if let Segment::Expr(expr) = seg {
                        if let Ok(r) = Reference::parse(expr) {
                            out.push(r);
                        }
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "list",
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
    }
}

/// Values visible to expressions, grouped under the `var`, `local`, `data`,
/// `source` and `build` roots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvalContext {
    roots: BTreeMap<String, Map<String, Value>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace_mut(&mut self, root: &str) -> &mut Map<String, Value> {
        self.roots.entry(root.to_string()).or_default()
    }

    fn namespace(&self, root: &str) -> Option<&Map<String, Value>> {
        self.roots.get(root)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.namespace_mut(VAR_ROOT).insert(name.into(), value);
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.namespace(VAR_ROOT).and_then(|m| m.get(name))
    }

    pub fn vars(&self) -> Map<String, Value> {
        self.namespace(VAR_ROOT).cloned().unwrap_or_default()
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.namespace_mut(LOCAL_ROOT).insert(name.into(), value);
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.namespace(LOCAL_ROOT).and_then(|m| m.get(name))
    }

    pub fn set_data(&mut self, kind: &str, name: &str, value: Value) {
        let by_type = self.namespace_mut(DATA_ROOT).entry(kind.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !by_type.is_object() {
            *by_type = Value::Object(Map::new());
        }
        if let Value::Object(map) = by_type {
            map.insert(name.to_string(), value);
        }
    }

    pub fn data(&self, kind: &str, name: &str) -> Option<&Value> {
        self.data_of_type(kind).and_then(|m| m.get(name))
    }

    pub fn data_of_type(&self, kind: &str) -> Option<&Map<String, Value>> {
        self.namespace(DATA_ROOT).and_then(|m| m.get(kind)).and_then(Value::as_object)
    }

    pub fn with_source(&self, kind: &str, name: &str) -> Self {
        let mut ctx = self.clone();
        let source = ctx.namespace_mut(SOURCE_ROOT);
        source.insert("type".into(), Value::String(kind.to_string()));
        source.insert("name".into(), Value::String(name.to_string()));
        ctx
    }

    pub fn with_build(&self, values: Map<String, Value>) -> Self {
        let mut ctx = self.clone();
        ctx.roots.insert(BUILD_ROOT.to_string(), values);
        ctx
    }

    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        let mut current = self.roots.get(reference.root())?.get(&reference.path[1])?;
        for seg in &reference.path[2..] {
            current = match current {
                Value::Object(map) => map.get(seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                // attributes of a placeholder are placeholders too
                Value::String(s) if s == UNKNOWN_VALUE => return Some(current.clone()),
                _ => return None,
            };
        }
        Some(current.clone())
    }

    fn resolve(&self, expr: &str) -> Result<Value, EvalError> {
        let reference = Reference::parse(expr)?;
        self.lookup(&reference).ok_or_else(|| EvalError::UnknownReference(reference.to_string()))
    }

    /// Evaluates every string in `value`. A string that is exactly one
    /// `${...}` takes the referenced value's type; otherwise references are
    /// rendered into the surrounding text.
    pub fn interpolate(&self, value: &Value) -> Result<Value, EvalError> {
        match value {
            Value::String(s) => self.interpolate_str(s),
            Value::Array(items) => items.iter().map(|v| self.interpolate(v)).collect::<Result<Vec<_>, _>>().map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn interpolate_str(&self, s: &str) -> Result<Value, EvalError> {
        let segs = segments(s)?;
        if let [Segment::Expr(expr)] = segs.as_slice() {
            return self.resolve(expr);
        }

        let mut out = String::with_capacity(s.len());
        for seg in segs {
            match seg {
                Segment::Text(text) => out.push_str(&text),
                Segment::Expr(expr) => match self.resolve(expr)? {
                    Value::String(v) => out.push_str(&v),
                    Value::Null => {}
                    v @ (Value::Bool(_) | Value::Number(_)) => out.push_str(&v.to_string()),
                    v => return Err(EvalError::NotAString { reference: expr.trim().to_string(), kind: kind_of(&v) }),
                },
            }
        }
        Ok(Value::String(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.set_var("region", json!("eu-west-1"));
        ctx.set_var("count", json!(3));
        ctx.set_var("tags", json!(["a", "b"]));
        ctx.set_data("static", "base", json!({"image": "ubuntu-22.04", "size": {"disk": 20}}));
        ctx
    }

    #[test]
    fn whole_reference_keeps_type() {
        let c = ctx();
        assert_eq!(c.interpolate_str("${var.count}").unwrap(), json!(3));
        assert_eq!(c.interpolate_str("${var.tags}").unwrap(), json!(["a", "b"]));
        assert_eq!(c.interpolate_str("${data.static.base.size.disk}").unwrap(), json!(20));
        assert_eq!(c.interpolate_str("${var.tags[1]}").unwrap(), json!("b"));
    }

    #[test]
    fn embedded_references_render_as_text() {
        let c = ctx();
        assert_eq!(c.interpolate_str("img-${data.static.base.image}-${var.count}").unwrap(), json!("img-ubuntu-22.04-3"));
        assert_eq!(c.interpolate_str("literal $${var.region}").unwrap(), json!("literal ${var.region}"));
        assert_eq!(c.interpolate_str("no refs").unwrap(), json!("no refs"));
    }

    #[test]
    fn errors_name_the_reference() {
        let c = ctx();
        assert_eq!(c.interpolate_str("${var.missing}").unwrap_err(), EvalError::UnknownReference("var.missing".into()));
        assert_eq!(c.interpolate_str("x ${var.region").unwrap_err(), EvalError::Unterminated("x ${var.region".into()));
        assert_eq!(c.interpolate_str("${nope}").unwrap_err(), EvalError::InvalidReference("nope".into()));
        assert_eq!(
            c.interpolate_str("tags: ${var.tags}").unwrap_err(),
            EvalError::NotAString { reference: "var.tags".into(), kind: "list" }
        );
    }

    #[test]
    fn placeholders_flow_through() {
        let mut c = ctx();
        c.set_data("http", "api", json!(UNKNOWN_VALUE));
        assert_eq!(c.interpolate_str("${data.http.api.body}").unwrap(), json!(UNKNOWN_VALUE));
        let b = c.with_build(Map::from_iter([("ID".to_string(), json!(UNKNOWN_VALUE))]));
        assert_eq!(b.interpolate_str("id=${build.ID}").unwrap(), json!("id=<unknown>"));
    }

    #[test]
    fn finds_references_in_nested_values() {
        let body = json!({"a": "${data.static.base.image}", "b": ["${var.region}-${local.x}", 1], "c": "$${data.not.real}"});
        let refs: Vec<String> = references(&body).iter().map(ToString::to_string).collect();
        assert_eq!(refs, vec!["data.static.base.image", "var.region", "local.x"]);
    }
}
