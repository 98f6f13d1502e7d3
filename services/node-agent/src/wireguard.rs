//! WireGuard interface management.
//!
//! Applying a configuration means writing it to disk and cycling the
//! interface with `wg-quick`. Taking the interface down is allowed to fail
//! (it is not up on first boot); bringing it up is not.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::AgentError;

/// Something that can bring a WireGuard configuration into effect.
#[async_trait]
pub trait Interface: Send + Sync {
    async fn apply(&self, config: &str) -> Result<(), AgentError>;
}

/// `wg-quick` backed interface.
#[derive(Debug, Clone)]
pub struct WgQuick {
    config_path: PathBuf,
    interface: String,
    program: PathBuf,
}

impl WgQuick {
    pub fn new(config_path: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            config_path: config_path.into(),
            interface: interface.into(),
            program: PathBuf::from("wg-quick"),
        }
    }

    /// Use another executable in place of `wg-quick`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    async fn write_config(&self, config: &str) -> Result<(), AgentError> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.config_path, config).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        Ok(())
    }

    async fn run(&self, action: &str) -> Result<Output, AgentError> {
        debug!(program = %self.program.display(), action, interface = %self.interface, "wg-quick");
        Command::new(&self.program)
            .arg(action)
            .arg(&self.interface)
            .output()
            .await
            .map_err(|e| {
                AgentError::Apply(format!(
                    "failed to execute {} {action}: {e}",
                    self.program.display()
                ))
            })
    }
}

#[async_trait]
impl Interface for WgQuick {
    async fn apply(&self, config: &str) -> Result<(), AgentError> {
        self.write_config(config).await?;

        match self.run("down").await {
            Ok(out) if !out.status.success() => {
                debug!(
                    interface = %self.interface,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "interface was not up"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "ignoring failed interface down"),
        }

        let out = self.run("up").await?;
        if !out.status.success() {
            return Err(AgentError::Apply(format!(
                "{} up {} failed: {}",
                self.program.display(),
                self.interface,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        info!(interface = %self.interface, path = %self.config_path.display(), "interface up");
        Ok(())
    }
}
