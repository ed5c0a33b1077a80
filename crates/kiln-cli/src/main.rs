use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_config::{OnError, VarInputs};
use kiln_core::{BasicUi, CancelToken, MachineReadableUi, PluginContext, RunUuid, SecretFilter, SharedUi};
use kiln_registry::KILN_RUN_UUID;
use kiln_scheduler::{write_diagnostics, Scheduler, SchedulerOptions, UserSettings};

#[derive(Parser, Debug)]
#[command(name = "kiln", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every build of a template
    Build(BuildArgs),

    /// Check that a template is valid
    Validate {
        /// Only check syntax; do not evaluate variables or builds
        #[arg(long)]
        syntax_only: bool,
        /// Execute datasources while validating
        #[arg(long)]
        evaluate_datasources: bool,
        #[command(flatten)]
        filters: FilterArgs,
        #[command(flatten)]
        template: TemplateArgs,
    },

    /// List the variables, sources and builds of a template
    Inspect {
        #[command(flatten)]
        template: TemplateArgs,
    },

    /// Print the kiln version
    Version,
}

#[derive(Args, Debug)]
struct TemplateArgs {
    /// Variable override, `key=value`; repeatable
    #[arg(long = "var")]
    vars: Vec<String>,
    /// Variable file (.toml, .json, .yaml); repeatable
    #[arg(long = "var-file")]
    var_files: Vec<PathBuf>,
    /// Template file or directory of *.kiln.toml files
    path: PathBuf,
}

impl TemplateArgs {
    fn inputs(&self) -> Result<VarInputs, kiln_core::Diagnostic> {
        Ok(VarInputs { files: self.var_files.clone(), overrides: VarInputs::parse_overrides(&self.vars)? })
    }
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Build only these builds (glob patterns, comma separated)
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Build everything except these builds (glob patterns, comma separated)
    #[arg(long, value_delimiter = ',')]
    except: Vec<String>,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(flatten)]
    filters: FilterArgs,
    /// Step through builds one at a time
    #[arg(long)]
    debug: bool,
    /// Replace existing artifacts
    #[arg(long)]
    force: bool,
    /// cleanup, abort or run-cleanup-provisioner
    #[arg(long)]
    on_error: Option<OnError>,
    /// Number of builds to run at once; 0 means all
    #[arg(long)]
    parallel_builds: Option<usize>,
    /// Colorize per-build output
    #[arg(long)]
    color: Option<bool>,
    /// Prefix output lines with a timestamp
    #[arg(long)]
    timestamp_ui: bool,
    /// Write machine-readable records to stdout
    #[arg(long)]
    machine_readable: bool,
    #[command(flatten)]
    template: TemplateArgs,
}

fn ui(machine_readable: bool, secrets: &Arc<SecretFilter>) -> SharedUi {
    if machine_readable {
        Arc::new(MachineReadableUi::stdout(secrets.clone()))
    } else {
        Arc::new(BasicUi::stdio(secrets.clone()))
    }
}

/// Builder for one scheduler command; variable input problems are printed
/// and turned into exit code 1.
fn scheduler(
    mut opts: SchedulerOptions,
    template: &TemplateArgs,
    settings: &UserSettings,
    ui: SharedUi,
    secrets: Arc<SecretFilter>,
) -> Result<Scheduler, i32> {
    opts.vars = match template.inputs() {
        Ok(inputs) => inputs,
        Err(diag) => {
            write_diagnostics(&ui, &diag.into());
            return Err(1);
        }
    };
    let plugins = PluginContext::new(kiln_plugins::builtin_store(), secrets);
    Ok(Scheduler::new(opts, plugins, ui).with_registry_db(settings.registry_db.clone()))
}

fn build_options(args: &BuildArgs, settings: &UserSettings) -> SchedulerOptions {
    let mut opts = SchedulerOptions::from_settings(&args.template.path, settings);
    opts.build.only = args.filters.only.clone();
    opts.build.except = args.filters.except.clone();
    opts.build.debug = args.debug;
    opts.build.force = args.force;
    if let Some(on_error) = args.on_error {
        opts.build.on_error = on_error;
    }
    if let Some(n) = args.parallel_builds {
        opts.parallel_builds = n;
    }
    if let Some(color) = args.color {
        opts.color = color;
    }
    opts.timestamp_ui |= args.timestamp_ui;
    opts.machine_readable = args.machine_readable;
    opts
}

async fn build(args: BuildArgs, settings: UserSettings) -> i32 {
    let secrets = Arc::new(SecretFilter::new());
    let ui = ui(args.machine_readable, &secrets);
    let opts = build_options(&args, &settings);
    let mut scheduler = match scheduler(opts, &args.template, &settings, ui.clone(), secrets) {
        Ok(s) => s,
        Err(code) => return code,
    };

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        let ui = ui.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ui.error("Interrupt received. Cancelling builds...");
                cancel.cancel();
            }
        })
    };

    let outcome = scheduler.run(&cancel).await;
    interrupt.abort();
    outcome.exit_code()
}

fn validate(syntax_only: bool, evaluate_datasources: bool, filters: FilterArgs, template: TemplateArgs, settings: UserSettings) -> i32 {
    let secrets = Arc::new(SecretFilter::new());
    let ui = ui(false, &secrets);
    let mut opts = SchedulerOptions::from_settings(&template.path, &settings);
    opts.build.only = filters.only;
    opts.build.except = filters.except;
    match scheduler(opts, &template, &settings, ui, secrets) {
        Ok(s) => s.validate(syntax_only, evaluate_datasources).exit_code(),
        Err(code) => code,
    }
}

fn inspect(template: TemplateArgs, settings: UserSettings) -> i32 {
    let secrets = Arc::new(SecretFilter::new());
    let ui = ui(false, &secrets);
    let opts = SchedulerOptions::from_settings(&template.path, &settings);
    match scheduler(opts, &template, &settings, ui, secrets) {
        Ok(s) => s.inspect().1.exit_code(),
        Err(code) => code,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    // Every build of this invocation, and the manifest post-processor, share one run id.
    if std::env::var_os(KILN_RUN_UUID).is_none() {
        std::env::set_var(KILN_RUN_UUID, RunUuid::new().as_str());
    }

    let code = match cli.cmd {
        Command::Version => {
            println!("kiln v{}", env!("CARGO_PKG_VERSION"));
            0
        }
        Command::Build(args) => {
            let settings = UserSettings::load().context("load user settings")?;
            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("start runtime")?;
            runtime.block_on(build(args, settings))
        }
        Command::Validate { syntax_only, evaluate_datasources, filters, template } => {
            let settings = UserSettings::load().context("load user settings")?;
            validate(syntax_only, evaluate_datasources, filters, template, settings)
        }
        Command::Inspect { template } => {
            let settings = UserSettings::load().context("load user settings")?;
            inspect(template, settings)
        }
    };

    tracing::debug!(code, "exiting");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
