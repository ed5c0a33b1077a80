use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kiln_core::{
    format_build_duration, ArtifactRef, BuildUnit, CancelToken, ColoredUi, Diagnostic, Diagnostics, SharedUi, TargetedUi,
    TimestampedUi, Ui, BUILD_PALETTE,
};
use kiln_registry::Registry;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Knobs of one execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutorOptions {
    /// 0 lets every build run at once.
    pub parallel_builds: usize,
    pub debug: bool,
    pub color: bool,
    pub timestamp_ui: bool,
}

impl ExecutorOptions {
    /// Debug mode and a limit of one both run builds strictly one after the other.
    pub fn is_serial(&self) -> bool {
        self.debug || self.parallel_builds == 1
    }
}

/// Outcome of every build of a run.
#[derive(Default)]
pub struct ExecutionReport {
    pub artifacts: BTreeMap<String, Vec<ArtifactRef>>,
    /// Build name to its rendered error.
    pub errors: BTreeMap<String, String>,
    /// Registry problems and the cancellation notice.
    pub diagnostics: Diagnostics,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.diagnostics.has_errors() && !self.cancelled
    }
}

#[derive(Default)]
struct Shared {
    artifacts: Mutex<BTreeMap<String, Vec<ArtifactRef>>>,
    errors: Mutex<BTreeMap<String, String>>,
    diagnostics: Mutex<Diagnostics>,
}

impl Shared {
    fn record_error(&self, name: &str, err: String) {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string(), err);
    }

    fn push_diagnostic(&self, diag: Diagnostic) {
        self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner).push(diag);
    }
}

pub fn no_builds_diagnostic() -> Diagnostic {
    Diagnostic::error("No builds to run").with_detail(
        "A build command cannot run without at least one build to process. If the only or except flags have been \
         specified at run time check that at least one build is selected for execution.",
    )
}

pub fn cancelled_diagnostic() -> Diagnostic {
    Diagnostic::error("Build cancelled").with_detail("Cleanly cancelled builds after being interrupted.")
}

/// Runs plan units with at most `parallel_builds` in flight, calling the
/// registry hooks around each one.
pub struct Executor {
    opts: ExecutorOptions,
    registry: Arc<dyn Registry>,
    ui: SharedUi,
}

impl Executor {
    pub fn new(opts: ExecutorOptions, registry: Arc<dyn Registry>, ui: SharedUi) -> Self {
        Self { opts, registry, ui }
    }

    fn build_uis(&self, names: &[String]) -> Vec<SharedUi> {
        let colored = self.opts.color && !self.ui.is_machine_readable();
        let mut uis = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let mut ui = self.ui.clone();
            if colored {
                ui = Arc::new(ColoredUi::new(BUILD_PALETTE[i % BUILD_PALETTE.len()], ui));
                ui.say(&format!("{name}: output will be in this color."));
                if i + 1 == names.len() {
                    self.ui.say("");
                }
            }
            if self.opts.timestamp_ui {
                ui = Arc::new(TimestampedUi::new(ui));
            }
            uis.push(ui);
        }
        uis
    }

    pub async fn run(&self, builds: Vec<Arc<dyn BuildUnit>>, cancel: &CancelToken) -> ExecutionReport {
        if builds.is_empty() {
            let mut report = ExecutionReport::default();
            report.diagnostics.push(no_builds_diagnostic());
            return report;
        }

        tracing::debug!(debug = self.opts.debug, parallel_builds = self.opts.parallel_builds, "starting builds");
        if self.opts.debug {
            self.ui.say("Debug mode enabled. Builds will not be parallelized.");
        }

        let names: Vec<String> = builds.iter().map(|b| b.name()).collect();
        let uis = self.build_uis(&names);
        let limit = if self.opts.parallel_builds == 0 { builds.len() } else { self.opts.parallel_builds };
        let semaphore = Arc::new(Semaphore::new(limit));
        let shared = Arc::new(Shared::default());
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for ((build, name), ui) in builds.into_iter().zip(names).zip(uis) {
            if cancel.is_cancelled() {
                tracing::info!("Interrupted, not going to start any more builds.");
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit,
                _ = cancel.cancelled() => {
                    ui.error(&format!("Build '{name}' failed to acquire semaphore: run cancelled"));
                    shared.record_error(&name, "run cancelled".to_string());
                    break;
                }
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    ui.error(&format!("Build '{name}' failed to acquire semaphore: {e}"));
                    shared.record_error(&name, e.to_string());
                    break;
                }
            };

            let task = BuildTask { build, name: name.clone(), ui, registry: self.registry.clone(), cancel: cancel.clone(), shared: shared.clone() };
            tasks.spawn(async move {
                task.run().await;
                drop(permit);
            });

            if self.opts.is_serial() {
                tracing::debug!(build = %name, "waiting for build to finish before starting the next one");
                drain(&mut tasks, &shared).await;
            }
        }

        tracing::debug!("Waiting on builds to complete...");
        drain(&mut tasks, &shared).await;
        self.ui.say(&format!("\n==> Wait completed after {}", format_build_duration(started.elapsed())));

        let shared = Arc::try_unwrap(shared).unwrap_or_default();
        let mut report = ExecutionReport {
            artifacts: shared.artifacts.into_inner().unwrap_or_else(PoisonError::into_inner),
            errors: shared.errors.into_inner().unwrap_or_else(PoisonError::into_inner),
            diagnostics: shared.diagnostics.into_inner().unwrap_or_else(PoisonError::into_inner),
            cancelled: false,
        };

        if cancel.is_cancelled() {
            self.ui.say("Cleanly cancelled builds after being interrupted.");
            report.cancelled = true;
            report.diagnostics = Diagnostics::new();
            report.diagnostics.push(cancelled_diagnostic());
            return report;
        }

        self.summarize(&report);
        report
    }

    fn summarize(&self, report: &ExecutionReport) {
        let ui = &self.ui;
        if !report.errors.is_empty() {
            ui.machine("error-count", &[&report.errors.len().to_string()]);
            ui.error("\n==> Some builds didn't complete successfully and had errors:");
            for (name, err) in &report.errors {
                TargetedUi::new(name.clone(), ui.clone()).machine("error", &[err]);
                ui.error(&format!("--> {name}: {err}"));
            }
        }

        if report.artifacts.is_empty() {
            ui.say("\n==> Builds finished but no artifacts were created.");
            return;
        }
        ui.say("\n==> Builds finished. The artifacts of successful builds are:");
        for (name, artifacts) in &report.artifacts {
            let target = TargetedUi::new(name.clone(), ui.clone());
            target.machine("artifact-count", &[&artifacts.len().to_string()]);
            for (i, artifact) in artifacts.iter().enumerate() {
                let i = i.to_string();
                target.machine("artifact", &[&i, "builder-id", artifact.builder_id()]);
                target.machine("artifact", &[&i, "id", &artifact.id()]);
                target.machine("artifact", &[&i, "string", &artifact.string()]);
                let files = artifact.files();
                target.machine("artifact", &[&i, "files-count", &files.len().to_string()]);
                for (fi, file) in files.iter().enumerate() {
                    target.machine("artifact", &[&i, "file", &fi.to_string(), file]);
                }
                target.machine("artifact", &[&i, "end"]);
                ui.say(&format!("--> {name}: {}", artifact.string()));
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>, shared: &Shared) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "build task failed");
            shared.push_diagnostic(Diagnostic::error("Build task failed").with_detail(e.to_string()));
        }
    }
}

struct BuildTask {
    build: Arc<dyn BuildUnit>,
    name: String,
    ui: SharedUi,
    registry: Arc<dyn Registry>,
    cancel: CancelToken,
    shared: Arc<Shared>,
}

impl BuildTask {
    async fn run(self) {
        let name = &self.name;
        let started = Instant::now();

        if let Err(e) = self.registry.start_build(&self.cancel, name).await {
            if e.is_build_already_done() {
                self.ui.say(&format!("skipping already done build {name:?}"));
                return;
            }
            self.shared.push_diagnostic(Diagnostic::error(format!("registry: failed to start build {name:?}")).with_detail(e.to_string()));
            return;
        }

        tracing::info!(build = %name, "Starting build run");
        // A panicking plugin still has to complete its registry build.
        let unit = {
            let (build, cancel, ui) = (Arc::clone(&self.build), self.cancel.clone(), self.ui.clone());
            tokio::spawn(async move { build.run(&cancel, ui).await })
        };
        let (artifacts, run_err) = match unit.await {
            Ok(Ok(artifacts)) => (artifacts, None),
            Ok(Err(e)) => (Vec::new(), Some(e)),
            Err(e) => {
                tracing::error!(build = %name, error = %e, "build task panicked");
                (Vec::new(), Some(anyhow::anyhow!("build panicked: {e}")))
            }
        };
        let elapsed = format_build_duration(started.elapsed());

        let (artifacts, published) = self.registry.complete_build(&self.cancel, name, artifacts, run_err.as_ref()).await;
        if let Err(e) = published {
            let diag = if e.is_not_registry_artifact() {
                Diagnostic::error(format!("The {name:?} builder produced an artifact that cannot be pushed to the kiln registry"))
                    .with_detail(format!("{e}\nCheck that the builder reports registry images before trying again."))
            } else {
                Diagnostic::error(format!("publishing build metadata to the kiln registry for {name:?} failed")).with_detail(e.to_string())
            };
            self.shared.push_diagnostic(diag);
        }

        match run_err {
            Some(e) => {
                self.ui.error(&format!("Build '{name}' errored after {elapsed}: {e:#}"));
                self.shared.record_error(name, format!("{e:#}"));
            }
            None => {
                self.ui.say(&format!("Build '{name}' finished after {elapsed}."));
                if !artifacts.is_empty() {
                    self.shared.artifacts.lock().unwrap_or_else(PoisonError::into_inner).insert(name.clone(), artifacts);
                }
            }
        }
    }
}
