use std::path::PathBuf;

use kiln_config::{BuildOptions, VarInputs};

use crate::executor::ExecutorOptions;
use crate::settings::UserSettings;

/// Everything one `kiln build` needs besides the template itself.
#[derive(Clone, Debug, Default)]
pub struct SchedulerOptions {
    /// Template file or directory.
    pub path: PathBuf,
    pub build: BuildOptions,
    /// 0 runs every build at once.
    pub parallel_builds: usize,
    pub color: bool,
    pub timestamp_ui: bool,
    pub machine_readable: bool,
    pub vars: VarInputs,
}

impl SchedulerOptions {
    /// Options for `path` seeded from the user's settings file.
    pub fn from_settings(path: impl Into<PathBuf>, settings: &UserSettings) -> Self {
        Self {
            path: path.into(),
            build: BuildOptions { on_error: settings.on_error, ..Default::default() },
            parallel_builds: settings.parallel_builds,
            color: settings.color,
            timestamp_ui: settings.timestamp_ui,
            machine_readable: false,
            vars: VarInputs::default(),
        }
    }

    pub fn executor(&self) -> ExecutorOptions {
        ExecutorOptions {
            parallel_builds: self.parallel_builds,
            debug: self.build.debug,
            color: self.color,
            timestamp_ui: self.timestamp_ui,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_config::OnError;

    #[test]
    fn settings_seed_the_defaults() {
        let settings = UserSettings { parallel_builds: 3, color: false, on_error: OnError::Abort, ..Default::default() };
        let opts = SchedulerOptions::from_settings("web.kiln.toml", &settings);
        assert_eq!(opts.parallel_builds, 3);
        assert!(!opts.color);
        assert_eq!(opts.build.on_error, OnError::Abort);

        let exec = opts.executor();
        assert_eq!(exec.parallel_builds, 3);
        assert!(!exec.is_serial());
    }

    #[test]
    fn debug_forces_serial_execution() {
        let mut opts = SchedulerOptions::default();
        opts.parallel_builds = 4;
        opts.build.debug = true;
        assert!(opts.executor().is_serial());
    }
}
