// Local command execution without SSH

use async_trait::async_trait;
use tokio::process::Command;

use super::{CollectError, CommandResult, Connection};

/// Local connection for running the probe on this machine
pub struct LocalConnection {
    host_name: String,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, CollectError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollectError::Exec {
                host: self.host_name.clone(),
                message: format!("failed to execute local command: {}", e),
            })?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}
