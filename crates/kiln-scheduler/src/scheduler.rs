use std::sync::Arc;

use kiln_config::{load_handler, ConfigHandler, Inspection};
use kiln_core::{BuildUnit, CancelToken, Diagnostic, Diagnostics, PluginContext, SharedUi};
use kiln_registry::{Connector, RegistryEnv};

use crate::diagnostics::write_diagnostics;
use crate::executor::{ExecutionReport, Executor};
use crate::options::SchedulerOptions;
use crate::registry::{registry_database, setup_registry, sqlite_connector};
use crate::settings::UserSettings;

/// Result of a scheduler command. Diagnostics have already been written to
/// the UI when this is returned.
#[derive(Default)]
pub struct RunOutcome {
    pub diagnostics: Diagnostics,
    /// Present once builds were handed to the executor.
    pub report: Option<ExecutionReport>,
}

impl RunOutcome {
    fn diagnostics_only(diagnostics: Diagnostics) -> Self {
        Self { diagnostics, report: None }
    }

    pub fn is_success(&self) -> bool {
        !self.diagnostics.has_errors() && self.report.as_ref().map_or(true, ExecutionReport::is_success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Drives one template from loading to the last build.
pub struct Scheduler {
    opts: SchedulerOptions,
    plugins: PluginContext,
    ui: SharedUi,
    env: RegistryEnv,
    registry_db: String,
    connector: Option<Connector>,
}

impl Scheduler {
    pub fn new(opts: SchedulerOptions, plugins: PluginContext, ui: SharedUi) -> Self {
        Self {
            opts,
            plugins,
            ui,
            env: RegistryEnv::from_env(),
            registry_db: UserSettings::default().registry_db,
            connector: None,
        }
    }

    pub fn with_registry_env(mut self, env: RegistryEnv) -> Self {
        self.env = env;
        self
    }

    /// Local database used when `KILN_REGISTRY_DB` is unset.
    pub fn with_registry_db(mut self, db: impl Into<String>) -> Self {
        self.registry_db = db.into();
        self
    }

    /// Replaces the SQLite registry service.
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    fn report(&self, all: &mut Diagnostics, diags: Diagnostics) -> bool {
        write_diagnostics(&self.ui, &diags);
        let failed = diags.has_errors();
        all.append(diags);
        failed
    }

    fn load(&self, all: &mut Diagnostics) -> Option<Box<dyn ConfigHandler>> {
        match load_handler(&self.opts.path, self.plugins.clone(), &self.opts.vars) {
            Ok((handler, diags)) => (!self.report(all, diags)).then_some(handler),
            Err(e) => {
                self.report(all, e.to_diagnostic().into());
                None
            }
        }
    }

    fn initialize(&self, handler: &mut dyn ConfigHandler, skip_datasources: bool, all: &mut Diagnostics) -> bool {
        if self.report(all, handler.evaluate_datasources(skip_datasources)) {
            return false;
        }
        if self.report(all, handler.evaluate_variables()) {
            return false;
        }
        !self.report(all, handler.evaluate_builds())
    }

    /// `kiln build`: evaluate the template, set up registry sync, then run
    /// every selected build.
    pub async fn run(&mut self, cancel: &CancelToken) -> RunOutcome {
        let mut all = Diagnostics::new();
        let Some(mut handler) = self.load(&mut all) else {
            return RunOutcome::diagnostics_only(all);
        };
        if !self.initialize(handler.as_mut(), false, &mut all) {
            return RunOutcome::diagnostics_only(all);
        }

        let setup = handler.registry_setup();
        let connector = match self.connector.take() {
            Some(connector) => connector,
            None => sqlite_connector(registry_database(&self.env, &self.registry_db), self.env.destination()),
        };
        let (registry, diags) = setup_registry(&setup, &self.env, connector, self.ui.clone());
        if self.report(&mut all, diags) {
            return RunOutcome::diagnostics_only(all);
        }

        if let Err(e) = registry.populate_version().await {
            tracing::error!(error = %e, "populating registry version failed");
            self.report(&mut all, Diagnostic::error("registry: populating version failed").with_detail(e.to_string()).into());
            return RunOutcome::diagnostics_only(all);
        }

        let (builds, diags) = handler.get_builds(&self.opts.build);
        // valid builds still run when siblings failed to compile
        if self.report(&mut all, diags) && builds.is_empty() {
            return RunOutcome::diagnostics_only(all);
        }

        let units: Vec<Arc<dyn BuildUnit>> = builds.into_iter().map(|b| Arc::new(b) as Arc<dyn BuildUnit>).collect();
        tracing::info!(builds = units.len(), "running builds");
        let executor = Executor::new(self.opts.executor(), registry.clone(), self.ui.clone());
        let report = executor.run(units, cancel).await;
        self.report(&mut all, report.diagnostics.clone());

        registry.version_status_summary(&self.ui);
        RunOutcome { diagnostics: all, report: Some(report) }
    }

    /// `kiln validate`. Datasources are only executed when asked to.
    pub fn validate(&self, syntax_only: bool, evaluate_datasources: bool) -> RunOutcome {
        let mut all = Diagnostics::new();
        let Some(mut handler) = self.load(&mut all) else {
            return RunOutcome::diagnostics_only(all);
        };
        if syntax_only {
            self.ui.say("Syntax-only check passed. Everything looks okay.");
            return RunOutcome::diagnostics_only(all);
        }
        if !self.initialize(handler.as_mut(), !evaluate_datasources, &mut all) {
            return RunOutcome::diagnostics_only(all);
        }

        let (builds, diags) = handler.get_builds(&self.opts.build);
        if self.report(&mut all, diags) {
            return RunOutcome::diagnostics_only(all);
        }
        if builds.is_empty() {
            self.report(&mut all, crate::executor::no_builds_diagnostic().into());
            return RunOutcome::diagnostics_only(all);
        }
        self.ui.say("The configuration is valid.");
        RunOutcome::diagnostics_only(all)
    }

    /// `kiln inspect`: variables, sources and builds of a template, without
    /// running datasources.
    pub fn inspect(&self) -> (Option<Inspection>, RunOutcome) {
        let mut all = Diagnostics::new();
        let Some(mut handler) = self.load(&mut all) else {
            return (None, RunOutcome::diagnostics_only(all));
        };
        if !self.initialize(handler.as_mut(), true, &mut all) {
            return (None, RunOutcome::diagnostics_only(all));
        }
        let inspection = handler.inspect();
        write_inspection(&self.ui, &inspection);
        (Some(inspection), RunOutcome::diagnostics_only(all))
    }
}

fn write_inspection(ui: &SharedUi, inspection: &Inspection) {
    ui.say("Variables:\n");
    if inspection.variables.is_empty() {
        ui.say("  <No variables>");
    }
    for (name, value) in &inspection.variables {
        ui.say(&format!("  {name}: {value}"));
    }

    ui.say("\nSources:\n");
    if inspection.sources.is_empty() {
        ui.say("  <No sources>");
    }
    for source in &inspection.sources {
        ui.say(&format!("  {source}"));
    }

    ui.say("\nBuilds:\n");
    if inspection.builds.is_empty() {
        ui.say("  <No builds>");
    }
    for build in &inspection.builds {
        ui.say(&format!("  > {}:", build.name));
        for source in &build.sources {
            ui.say(&format!("    sources: {source}"));
        }
        for provisioner in &build.provisioners {
            ui.say(&format!("    provisioner: {provisioner}"));
        }
        for chain in &build.post_processors {
            ui.say(&format!("    post-processors: {}", chain.join(" > ")));
        }
    }
}
