//! Account provisioning — applying credential changes to the media server.
//!
//! The media server reads its accounts from the entitlement store and picks
//! up changes on restart, so "apply" boils down to running the configured
//! restart command. Entitlement state and external provisioning are only
//! eventually consistent: a failure here is surfaced and logged, never a
//! reason to roll back a committed store write.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Maximum time the restart command may run.
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// Provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("restart command failed: {0}")]
    Command(String),

    #[error("restart command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Applies entitlement changes to the external media server.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn apply_and_restart(&self, login: &str, credential: &str)
    -> Result<(), ProvisionError>;
}

/// Restarts the external media server so it reloads its accounts.
pub struct MediaServerProvisioner {
    restart_command: Vec<String>,
}

impl MediaServerProvisioner {
    /// `restart_command` is the full argv, e.g.
    /// `["systemctl", "restart", "streamserver"]`.
    pub fn new(restart_command: Vec<String>) -> Self {
        Self { restart_command }
    }
}

#[async_trait]
impl Provisioner for MediaServerProvisioner {
    async fn apply_and_restart(
        &self,
        login: &str,
        _credential: &str,
    ) -> Result<(), ProvisionError> {
        let Some((program, args)) = self.restart_command.split_first() else {
            return Err(ProvisionError::Command("empty restart command".into()));
        };

        let output = tokio::time::timeout(RESTART_TIMEOUT, Command::new(program).args(args).output())
            .await
            .map_err(|_| ProvisionError::Timeout(RESTART_TIMEOUT))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::Command(format!(
                "{program} exited with {}: {stderr}",
                output.status
            )));
        }

        info!(login, "media server restarted");
        Ok(())
    }
}

/// No-op provisioner for tests and dry runs.
pub struct NullProvisioner;

#[async_trait]
impl Provisioner for NullProvisioner {
    async fn apply_and_restart(
        &self,
        _login: &str,
        _credential: &str,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_provisions() {
        let provisioner = MediaServerProvisioner::new(vec!["true".into()]);
        provisioner
            .apply_and_restart("User1", "secret")
            .await
            .expect("true should succeed");
    }

    #[tokio::test]
    async fn failing_command_reports_error() {
        let provisioner = MediaServerProvisioner::new(vec!["false".into()]);
        let err = provisioner
            .apply_and_restart("User1", "secret")
            .await
            .expect_err("false should fail");
        assert!(matches!(err, ProvisionError::Command(_)));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let provisioner = MediaServerProvisioner::new(vec![]);
        let err = provisioner
            .apply_and_restart("User1", "secret")
            .await
            .expect_err("empty argv");
        assert!(matches!(err, ProvisionError::Command(_)));
    }
}
