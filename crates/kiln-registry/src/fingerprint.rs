use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use kiln_core::RunUuid;
use ulid::Ulid;

use crate::env::RegistryEnv;

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git").args(args).current_dir(dir).output().with_context(|| format!("run git {:?}", args))?;
    if !out.status.success() {
        return Err(anyhow!("git {:?} failed: {}", args, String::from_utf8_lossy(&out.stderr).trim()));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Identity of the configuration being built: the env override, else the
/// current git commit of `template_dir`, else a fresh ULID.
pub fn fingerprint(env: &RegistryEnv, template_dir: &Path) -> String {
    if let Some(fp) = &env.fingerprint {
        return fp.clone();
    }
    match git(template_dir, &["rev-parse", "HEAD"]) {
        Ok(head) if !head.is_empty() => head,
        Ok(_) => Ulid::new().to_string(),
        Err(e) => {
            tracing::debug!(dir = %template_dir.display(), error = %e, "no git fingerprint, generating one");
            Ulid::new().to_string()
        }
    }
}

pub fn run_uuid(env: &RegistryEnv) -> RunUuid {
    match &env.run_uuid {
        Some(id) => RunUuid::from_str(id.clone()),
        None => RunUuid::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_fingerprint_wins() {
        let env = RegistryEnv { fingerprint: Some("abc".into()), ..Default::default() };
        assert_eq!(fingerprint(&env, Path::new("/nonexistent")), "abc");
    }

    #[test]
    fn falls_back_to_ulid_outside_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let fp = fingerprint(&RegistryEnv::default(), dir.path());
        assert!(!fp.is_empty());
        assert_ne!(fp, fingerprint(&RegistryEnv::default(), dir.path()));
    }

    #[test]
    fn run_uuid_from_env() {
        let env = RegistryEnv { run_uuid: Some("run-1".into()), ..Default::default() };
        assert_eq!(run_uuid(&env).as_str(), "run-1");
        assert!(!run_uuid(&RegistryEnv::default()).is_empty());
    }
}
