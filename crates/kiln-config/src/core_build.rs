use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use kiln_core::{
    ArtifactRef, Builder, BuildUnit, CancelToken, GeneratedData, PostProcessor, ProvisionHook, Provisioner, SharedUi, TargetedUi,
};

use crate::handler::OnError;
use crate::policy::ProvisionError;

pub struct CoreBuildProvisioner {
    pub ptype: String,
    pub pname: String,
    pub provisioner: Box<dyn Provisioner>,
}

impl CoreBuildProvisioner {
    pub fn display_name(&self) -> &str {
        if self.pname.is_empty() {
            &self.ptype
        } else {
            &self.pname
        }
    }
}

pub struct CoreBuildPostProcessor {
    pub ptype: String,
    pub pname: String,
    pub post_processor: Box<dyn PostProcessor>,
    /// `None` when the template leaves it to the post-processor.
    pub keep_input_artifact: Option<bool>,
}

impl CoreBuildPostProcessor {
    pub fn display_name(&self) -> &str {
        if self.pname.is_empty() {
            &self.ptype
        } else {
            &self.pname
        }
    }
}

/// One fully prepared build: a builder, the provisioners it runs through its
/// hook, and the post-processor chains applied to its artifact.
pub struct CoreBuild {
    /// Name of the build block, empty when the block has none.
    pub build_name: String,
    pub kind: String,
    pub builder_type: String,
    pub builder: Box<dyn Builder>,
    pub provisioners: Vec<CoreBuildProvisioner>,
    pub cleanup_provisioner: Option<CoreBuildProvisioner>,
    pub post_processors: Vec<Vec<CoreBuildPostProcessor>>,
    pub debug: bool,
    pub force: bool,
    pub on_error: OnError,
}

pub fn build_unit_name(build_name: &str, kind: &str) -> String {
    if build_name.is_empty() {
        kind.to_string()
    } else {
        format!("{build_name}.{kind}")
    }
}

struct ProvisionerChain<'a> {
    provisioners: &'a [CoreBuildProvisioner],
    cleanup: Option<&'a CoreBuildProvisioner>,
    on_error: OnError,
}

impl ProvisionerChain<'_> {
    async fn run_cleanup(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) {
        let Some(cleanup) = self.cleanup else {
            return;
        };
        if self.on_error == OnError::Abort {
            tracing::debug!("on-error=abort, skipping the error-cleanup provisioner");
            return;
        }
        ui.say("Provisioning step had errors: Running the cleanup provisioner, if present...");
        if let Err(e) = cleanup.provisioner.provision(cancel, ui, data).await {
            ui.error(&format!("Error running the cleanup provisioner {}: {e:#}", cleanup.display_name()));
        }
    }
}

#[async_trait]
impl ProvisionHook for ProvisionerChain<'_> {
    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()> {
        for p in self.provisioners {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled.into());
            }
            ui.say(&format!("Provisioning with {}...", p.display_name()));
            if let Err(e) = p.provisioner.provision(cancel, ui, data).await {
                self.run_cleanup(cancel, ui, data).await;
                return Err(e.context(format!("provisioner {} failed", p.display_name())));
            }
        }
        Ok(())
    }
}

fn join_errors(errors: Vec<anyhow::Error>) -> anyhow::Error {
    if errors.len() == 1 {
        if let Some(e) = errors.into_iter().next() {
            return e;
        }
        return anyhow!("unknown error");
    }
    let mut msg = format!("{} error(s) occurred:", errors.len());
    for e in &errors {
        msg.push_str(&format!("\n\t* {e:#}"));
    }
    anyhow!(msg)
}

impl CoreBuild {
    pub fn name(&self) -> String {
        build_unit_name(&self.build_name, &self.kind)
    }

    async fn post_process(&self, cancel: &CancelToken, ui: &SharedUi, builder_artifact: ArtifactRef) -> anyhow::Result<Vec<ArtifactRef>> {
        let name = self.name();
        let mut artifacts: Vec<ArtifactRef> = Vec::new();
        let mut errors = Vec::new();
        let mut keep_original = self.post_processors.is_empty();

        'chains: for chain in &self.post_processors {
            let mut prior = builder_artifact.clone();
            for (i, pp) in chain.iter().enumerate() {
                let pp_ui: SharedUi = Arc::new(TargetedUi::new(format!("{name} ({})", pp.display_name()), ui.clone()));
                ui.say(&format!("==> {name}: Running post-processor: {}", pp.display_name()));
                let out = match pp.post_processor.post_process(cancel, &pp_ui, prior.clone()).await {
                    Ok(out) => out,
                    Err(e) => {
                        errors.push(anyhow!("Post-processor failed: {e:#}"));
                        continue 'chains;
                    }
                };

                let mut keep = out.keep_input;
                if let Some(requested) = pp.keep_input_artifact {
                    if out.keep_input && !requested && out.force_keep {
                        tracing::info!(
                            post_processor = %pp.ptype,
                            "post-processor forces keep_input_artifact=true; the template setting is ignored"
                        );
                    } else {
                        keep = requested;
                    }
                }

                if i == 0 {
                    // several chains may start from the builder artifact
                    if keep {
                        keep_original = true;
                    }
                } else if keep {
                    artifacts.push(prior.clone());
                } else {
                    tracing::debug!(post_processor = %pp.ptype, "deleting prior artifact");
                    if let Err(e) = prior.destroy() {
                        errors.push(anyhow!("Failed cleaning up prior artifact: {e:#}; pp is {}", pp.ptype));
                    }
                }
                prior = out.artifact;
            }
            artifacts.push(prior);
        }

        if keep_original {
            artifacts.insert(0, builder_artifact);
        } else {
            tracing::debug!(build = %name, "deleting original artifact");
            if let Err(e) = builder_artifact.destroy() {
                errors.push(anyhow!("Error destroying builder artifact: {e:#}; bad artifact: {:?}", builder_artifact.files()));
            }
        }

        if !errors.is_empty() {
            return Err(join_errors(errors));
        }
        Ok(artifacts)
    }
}

#[async_trait]
impl BuildUnit for CoreBuild {
    fn name(&self) -> String {
        CoreBuild::name(self)
    }

    async fn run(&self, cancel: &CancelToken, ui: SharedUi) -> anyhow::Result<Vec<ArtifactRef>> {
        let name = self.name();
        let build_ui: SharedUi = Arc::new(TargetedUi::new(name.clone(), ui.clone()));
        let hook = ProvisionerChain { provisioners: &self.provisioners, cleanup: self.cleanup_provisioner.as_ref(), on_error: self.on_error };

        tracing::info!(build = %name, builder = %self.builder_type, "running builder");
        let Some(artifact) = self.builder.run(cancel, &build_ui, &hook).await? else {
            tracing::info!(build = %name, "builder produced no artifact");
            return Ok(Vec::new());
        };
        self.post_process(cancel, &ui, artifact).await
    }
}
