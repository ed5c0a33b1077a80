use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use kiln_core::{
    ArtifactRef, BasicArtifact, BuilderVariables, CancelToken, ConfigValue, PostProcessed, PostProcessor, SharedUi, BUILDER_TYPE_VAR,
    BUILD_NAME_VAR,
};
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncWriteExt;

pub const BUILDER_ID: &str = "kiln.post-processor.checksum";
pub const DEFAULT_OUTPUT: &str = "kiln_{build_name}_{builder_type}_{checksum_type}.checksum";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumType {
    Sha256,
    Sha512,
}

impl ChecksumType {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => anyhow::bail!("Unrecognized checksum type: {other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest(&self, bytes: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(bytes)),
            Self::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChecksumConfig {
    #[serde(default)]
    pub checksum_types: Vec<String>,
    /// Output path pattern; `{build_name}`, `{builder_type}` and
    /// `{checksum_type}` are replaced.
    #[serde(default)]
    pub output: String,
}

/// Writes `<digest>\t<file name>` lines for every file of the input
/// artifact, one output file per checksum type.
#[derive(Default)]
pub struct ChecksumPostProcessor {
    types: Vec<ChecksumType>,
    output: String,
    build_name: String,
    builder_type: String,
}

impl ChecksumPostProcessor {
    fn output_path(&self, checksum_type: ChecksumType) -> String {
        self.output
            .replace("{build_name}", &self.build_name)
            .replace("{builder_type}", &self.builder_type)
            .replace("{checksum_type}", checksum_type.as_str())
    }
}

#[async_trait]
impl PostProcessor for ChecksumPostProcessor {
    fn configure(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        let parsed: ChecksumConfig = crate::decode("checksum", config)?;
        self.types = if parsed.checksum_types.is_empty() {
            vec![ChecksumType::Sha256]
        } else {
            parsed.checksum_types.iter().map(|t| ChecksumType::parse(t)).collect::<anyhow::Result<_>>()?
        };
        self.output = if parsed.output.is_empty() { DEFAULT_OUTPUT.to_string() } else { parsed.output };
        self.build_name = vars.get(BUILD_NAME_VAR).cloned().unwrap_or_default();
        self.builder_type = vars.get(BUILDER_TYPE_VAR).cloned().unwrap_or_default();
        Ok(())
    }

    async fn post_process(&self, _cancel: &CancelToken, ui: &SharedUi, input: ArtifactRef) -> anyhow::Result<PostProcessed> {
        let mut outputs = Vec::new();
        for checksum_type in &self.types {
            let path = self.output_path(*checksum_type);
            if let Some(parent) = Path::new(&path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.with_context(|| format!("unable to create dir: {}", parent.display()))?;
            }
            let mut out = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("unable to create file {path}"))?;

            for file in input.files() {
                let bytes = tokio::fs::read(&file).await.with_context(|| format!("unable to open file {file}"))?;
                let name = Path::new(&file).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| file.clone());
                out.write_all(format!("{}\t{name}\n", checksum_type.digest(&bytes)).as_bytes())
                    .await
                    .with_context(|| format!("unable to write checksum to {path}"))?;
            }
            out.flush().await?;
            ui.say(&format!("Wrote {} checksums to {path}", checksum_type.as_str()));
            outputs.push(path);
        }

        let artifact = BasicArtifact::new(BUILDER_ID, input.id())
            .with_files(outputs.clone())
            .with_description(format!("Created artifact from files: {}", outputs.join(", ")));
        Ok(PostProcessed { artifact: Arc::new(artifact), keep_input: true, force_keep: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_types_are_rejected() {
        assert_eq!(ChecksumType::parse("md5").unwrap_err().to_string(), "Unrecognized checksum type: md5");
        assert_eq!(ChecksumType::parse("sha512").unwrap(), ChecksumType::Sha512);
    }

    #[test]
    fn digest_matches_known_values() {
        assert_eq!(ChecksumType::Sha256.digest(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(ChecksumType::Sha512.digest(b"").len(), 128);
    }

    #[test]
    fn output_pattern_is_expanded() {
        let mut pp = ChecksumPostProcessor::default();
        let vars = BuilderVariables::from([
            (BUILD_NAME_VAR.to_string(), "web.file.a".to_string()),
            (BUILDER_TYPE_VAR.to_string(), "file".to_string()),
        ]);
        pp.configure(&vars, &serde_json::json!({})).unwrap();
        assert_eq!(pp.output_path(ChecksumType::Sha256), "kiln_web.file.a_file_sha256.checksum");
    }
}
