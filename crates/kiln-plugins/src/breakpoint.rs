use async_trait::async_trait;
use kiln_core::{BuilderVariables, CancelToken, ConfigValue, GeneratedData, Provisioner, SharedUi};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BreakpointConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub note: String,
}

/// Pauses the build until enter is pressed on the terminal.
#[derive(Default)]
pub struct BreakpointProvisioner {
    config: BreakpointConfig,
}

impl BreakpointProvisioner {
    fn pause_message(&self) -> String {
        if self.config.note.is_empty() {
            "Pausing at breakpoint provisioner. Press enter to continue.".to_string()
        } else {
            format!("Pausing at breakpoint provisioner with note \"{}\". Press enter to continue.", self.config.note)
        }
    }
}

#[async_trait]
impl Provisioner for BreakpointProvisioner {
    fn prepare(&mut self, _vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        self.config = crate::decode("breakpoint", config)?;
        Ok(())
    }

    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, _data: &GeneratedData) -> anyhow::Result<()> {
        if self.config.disable {
            ui.say("Breakpoint provisioner disabled.");
            return Ok(());
        }
        ui.say(&self.pause_message());

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            read = stdin.read_line(&mut line) => {
                read?;
                Ok(())
            }
            _ = cancel.cancelled() => anyhow::bail!("breakpoint cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::RecordingUi;
    use std::sync::Arc;

    #[tokio::test]
    async fn disabled_breakpoint_does_not_wait() {
        let mut p = BreakpointProvisioner::default();
        p.prepare(&BuilderVariables::new(), &serde_json::json!({"disable": true, "note": "x"})).unwrap();
        let ui = Arc::new(RecordingUi::new());
        let shared: SharedUi = ui.clone();
        p.provision(&CancelToken::new(), &shared, &GeneratedData::new()).await.unwrap();
        assert!(ui.contains("Breakpoint provisioner disabled."));
    }

    #[test]
    fn note_is_part_of_the_pause_message() {
        let mut p = BreakpointProvisioner::default();
        p.prepare(&BuilderVariables::new(), &serde_json::json!({"note": "check disk"})).unwrap();
        assert_eq!(p.pause_message(), "Pausing at breakpoint provisioner with note \"check disk\". Press enter to continue.");
    }
}
