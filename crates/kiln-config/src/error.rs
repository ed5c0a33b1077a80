use std::path::PathBuf;

use kiln_core::Diagnostic;
use thiserror::Error;

/// Problems loading template or variable files from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("no *.kiln.toml files found in {}", .0.display())]
    NoTemplates(PathBuf),

    #[error("unsupported file extension for {}; expected .kiln.toml, .toml, .json, .yaml or .yml", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Duplicate {kind} definition")]
    Duplicate { kind: &'static str, name: String, path: PathBuf },
}

impl ConfigError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ConfigError::Duplicate { name, path, .. } => Diagnostic::error(self.to_string())
                .with_detail(format!("Duplicate {name} definition found."))
                .with_subject(path.display().to_string()),
            _ => Diagnostic::error(self.to_string()),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("Unknown reference {0}")]
    UnknownReference(String),

    #[error("Unterminated expression in {0:?}")]
    Unterminated(String),

    #[error("Invalid reference {0:?}")]
    InvalidReference(String),

    #[error("Cannot embed {reference} in a string: it is a {kind}")]
    NotAString { reference: String, kind: &'static str },
}

impl EvalError {
    pub fn to_diagnostic(&self, subject: impl Into<String>) -> Diagnostic {
        Diagnostic::error(self.to_string()).with_subject(subject)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationError {
    pub input: String,
    pub reason: &'static str,
}
