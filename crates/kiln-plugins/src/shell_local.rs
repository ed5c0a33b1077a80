use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use kiln_core::{BuilderVariables, CancelToken, ConfigValue, GeneratedData, Provisioner, SharedUi, BUILDER_TYPE_VAR, BUILD_NAME_VAR};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

fn default_execute_command() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShellLocalConfig {
    /// Lines joined into one script.
    #[serde(default)]
    pub inline: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    /// `KEY=value` pairs added to the environment.
    #[serde(default)]
    pub environment_vars: Vec<String>,
    /// Program and leading arguments; the script is passed as the last one.
    #[serde(default = "default_execute_command")]
    pub execute_command: Vec<String>,
    #[serde(default = "default_exit_codes")]
    pub valid_exit_codes: Vec<i32>,
}

impl Default for ShellLocalConfig {
    fn default() -> Self {
        Self {
            inline: Vec::new(),
            command: None,
            environment_vars: Vec::new(),
            execute_command: default_execute_command(),
            valid_exit_codes: default_exit_codes(),
        }
    }
}

/// Runs a shell script on the machine running kiln, streaming its output
/// to the build's UI.
#[derive(Default)]
pub struct ShellLocalProvisioner {
    config: ShellLocalConfig,
    script: String,
    env: Vec<(String, String)>,
}

#[async_trait]
impl Provisioner for ShellLocalProvisioner {
    fn prepare(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        let parsed: ShellLocalConfig = crate::decode("shell-local", config)?;
        self.script = match (&parsed.command, parsed.inline.is_empty()) {
            (Some(_), false) => anyhow::bail!("Only one of command or inline may be specified"),
            (None, true) => anyhow::bail!("Command or inline must be specified"),
            (Some(command), true) => command.clone(),
            (None, false) => parsed.inline.join("\n"),
        };
        if parsed.execute_command.is_empty() {
            anyhow::bail!("execute_command must not be empty");
        }

        let mut env = Vec::new();
        for (key, var) in [("KILN_BUILD_NAME", BUILD_NAME_VAR), ("KILN_BUILDER_TYPE", BUILDER_TYPE_VAR)] {
            if let Some(value) = vars.get(var) {
                env.push((key.to_string(), value.clone()));
            }
        }
        for pair in &parsed.environment_vars {
            match pair.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => env.push((key.trim().to_string(), value.to_string())),
                _ => anyhow::bail!("Environment variable not in format 'key=value': {pair}"),
            }
        }

        self.env = env;
        self.config = parsed;
        Ok(())
    }

    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()> {
        let (program, args) = self.config.execute_command.split_first().context("execute_command must not be empty")?;
        ui.say("Running local shell script");
        tracing::debug!(program = %program, "shell-local starting");

        let mut child = Command::new(program)
            .args(args)
            .arg(&self.script)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .envs(data.iter().filter_map(|(k, v)| v.as_str().map(|s| (format!("KILN_BUILD_{}", k.to_ascii_uppercase()), s.to_string()))))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;

        let mut streams = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let ui = ui.clone();
            streams.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ui.say(&line);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let ui = ui.clone();
            streams.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ui.error(&line);
                }
            }));
        }

        let status = tokio::select! {
            status = child.wait() => status.context("failed waiting for local shell script")?,
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                anyhow::bail!("local shell script cancelled");
            }
        };
        for stream in streams {
            stream.await.ok();
        }

        let code = status.code().unwrap_or(-1);
        if !self.config.valid_exit_codes.contains(&code) {
            anyhow::bail!("Erroneous exit code {code} while executing script");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prepare(config: ConfigValue) -> anyhow::Result<ShellLocalProvisioner> {
        let mut p = ShellLocalProvisioner::default();
        let vars = BuilderVariables::from([(BUILD_NAME_VAR.to_string(), "null.a".to_string())]);
        p.prepare(&vars, &config)?;
        Ok(p)
    }

    #[test]
    fn command_and_inline_are_exclusive() {
        let err = prepare(json!({"command": "true", "inline": ["true"]})).err().unwrap();
        assert_eq!(err.to_string(), "Only one of command or inline may be specified");
        let err = prepare(json!({})).err().unwrap();
        assert_eq!(err.to_string(), "Command or inline must be specified");
    }

    #[test]
    fn inline_lines_form_one_script_and_env_is_collected() {
        let p = prepare(json!({"inline": ["echo a", "echo b"], "environment_vars": ["A=1", "B=x=y"]})).unwrap();
        assert_eq!(p.script, "echo a\necho b");
        assert_eq!(
            p.env,
            vec![("KILN_BUILD_NAME".into(), "null.a".into()), ("A".into(), "1".into()), ("B".into(), "x=y".into())]
        );
    }

    #[test]
    fn malformed_environment_var_is_rejected() {
        let err = prepare(json!({"command": "true", "environment_vars": ["NOEQUALS"]})).err().unwrap();
        assert_eq!(err.to_string(), "Environment variable not in format 'key=value': NOEQUALS");
    }
}
