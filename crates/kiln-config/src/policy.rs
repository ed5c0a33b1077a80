use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{BuilderVariables, CancelToken, ConfigValue, GeneratedData, Provisioner, SharedUi};
use thiserror::Error;

use crate::duration::display_duration;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("provisioning cancelled")]
    Cancelled,
    #[error("provisioner timed out after {}", display_duration(*.0))]
    TimedOut(Duration),
}

/// How a provisioner block asked to be run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProvisionerPolicy {
    pub pause_before: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// What happens before each attempt. Pausing and timing out are exclusive;
/// a pause wins when both are configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    None,
    Pause(Duration),
    Timeout(Duration),
}

impl ProvisionerPolicy {
    pub fn is_plain(&self) -> bool {
        self.gate() == Gate::None && self.max_retries == 0
    }

    pub fn gate(&self) -> Gate {
        if !self.pause_before.is_zero() {
            Gate::Pause(self.pause_before)
        } else if !self.timeout.is_zero() {
            Gate::Timeout(self.timeout)
        } else {
            Gate::None
        }
    }
}

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(32);

fn retry_delay(attempt: u32) -> Duration {
    RETRY_INITIAL_BACKOFF.saturating_mul(attempt).min(RETRY_MAX_BACKOFF)
}

/// A provisioner run under a [`ProvisionerPolicy`]: the gate applies to
/// every attempt and retries wrap the gated call.
pub struct PolicyProvisioner {
    inner: Box<dyn Provisioner>,
    policy: ProvisionerPolicy,
}

impl PolicyProvisioner {
    /// Returns `inner` untouched when the policy asks for nothing.
    pub fn wrap(inner: Box<dyn Provisioner>, policy: ProvisionerPolicy) -> Box<dyn Provisioner> {
        if policy.is_plain() {
            return inner;
        }
        Box::new(Self { inner, policy })
    }

    async fn attempt(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()> {
        match self.policy.gate() {
            Gate::None => self.inner.provision(cancel, ui, data).await,
            Gate::Pause(d) => {
                ui.say(&format!("Pausing {} before the next provisioner...", display_duration(d)));
                tokio::select! {
                    _ = tokio::time::sleep(d) => {}
                    _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
                }
                self.inner.provision(cancel, ui, data).await
            }
            Gate::Timeout(d) => {
                ui.say(&format!("Setting a {} timeout for the next provisioner...", display_duration(d)));
                match tokio::time::timeout(d, self.inner.provision(cancel, ui, data)).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::warn!(timeout = %display_duration(d), "provisioner timed out");
                        Err(ProvisionError::TimedOut(d).into())
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Provisioner for PolicyProvisioner {
    fn prepare(&mut self, vars: &BuilderVariables, config: &ConfigValue) -> anyhow::Result<()> {
        self.inner.prepare(vars, config)
    }

    async fn provision(&self, cancel: &CancelToken, ui: &SharedUi, data: &GeneratedData) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled.into());
        }
        let mut err = match self.attempt(cancel, ui, data).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let max = self.policy.max_retries;
        for attempt in 1..=max {
            let left = max - attempt + 1;
            ui.say(&format!("Provisioner failed with {:?}, retrying with {left} trie(s) left", err.to_string()));
            tokio::select! {
                _ = tokio::time::sleep(retry_delay(attempt)) => {}
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
            }
            match self.attempt(cancel, ui, data).await {
                Ok(()) => return Ok(()),
                Err(e) => err = e,
            }
            if left == 1 {
                ui.say("retry limit reached.");
            }
        }
        Err(err)
    }
}
