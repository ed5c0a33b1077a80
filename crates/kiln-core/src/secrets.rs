use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

pub const REDACTED: &str = "<sensitive>";

/// Replaces sensitive variable values in anything written to the UI.
///
/// One filter is created per run and handed down through the plugin context;
/// there is no process-wide instance.
#[derive(Debug, Default)]
pub struct SecretFilter {
    values: RwLock<BTreeSet<String>>,
}

impl SecretFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.is_empty() {
            return;
        }
        self.values.write().unwrap_or_else(PoisonError::into_inner).insert(secret);
    }

    pub fn filter(&self, message: &str) -> String {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        // longest first so a secret containing another one is fully masked
        let mut sorted: Vec<&String> = values.iter().collect();
        sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let mut out = message.to_string();
        for secret in sorted {
            out = out.replace(secret.as_str(), REDACTED);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_every_registered_value() {
        let f = SecretFilter::new();
        f.add("hunter2");
        f.add("");
        assert_eq!(f.filter("password is hunter2, again hunter2"), "password is <sensitive>, again <sensitive>");
        assert_eq!(f.filter("nothing here"), "nothing here");
    }

    #[test]
    fn longer_secret_wins_over_prefix() {
        let f = SecretFilter::new();
        f.add("abc");
        f.add("abcdef");
        assert_eq!(f.filter("token=abcdef"), "token=<sensitive>");
    }
}
