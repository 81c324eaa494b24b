// Scheduled-task collection: the payload the CLI fans out

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::{ConnectionMode, LocalHostSet, Payload, Route};

pub mod cron;
pub mod local;
pub mod ssh;

pub use cron::{parse_probe_output, HostInventory, ScheduledTask, TaskSource};
pub use local::LocalConnection;
pub use ssh::SshConnection;

/// Output of a command run on a target
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors raised while collecting from one host
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("cannot connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("authentication failed for {user}@{host}")]
    Auth { host: String, user: String },

    #[error("{host}: {message}")]
    Exec { host: String, message: String },

    #[error("{host}: probe exited with status {exit_code}: {stderr}")]
    Probe {
        host: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Common trait for local and SSH command execution
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a command and return the result
    async fn exec(&self, cmd: &str) -> Result<CommandResult, CollectError>;

    /// Get the host name for this connection
    fn host_name(&self) -> &str;
}

/// Shell script that dumps every scheduling source, one marked section each
pub const PROBE_SCRIPT: &str = r#"echo '### taskscan:hostname'
hostname 2>/dev/null || uname -n
echo '### taskscan:crontab'
crontab -l 2>/dev/null
for f in /etc/crontab /etc/cron.d/*; do
  if [ -f "$f" ]; then
    echo '### taskscan:file '"$f"
    cat "$f" 2>/dev/null
  fi
done
if command -v systemctl >/dev/null 2>&1; then
  echo '### taskscan:timers'
  systemctl list-timers --all --no-legend --no-pager 2>/dev/null
fi
exit 0
"#;

/// Collects cron entries and systemd timers from a host
///
/// Local routes to a local name run the probe with `sh`. Everything else goes
/// over SSH: remote routes with the supplied credential, local routes to a
/// foreign name with the caller's own identity (agent and default keys).
#[derive(Debug, Clone)]
pub struct ScheduledTaskCollector {
    local_hosts: LocalHostSet,
    port: u16,
    connect_timeout: Duration,
}

impl ScheduledTaskCollector {
    pub fn new(local_hosts: LocalHostSet) -> Self {
        ScheduledTaskCollector {
            local_hosts,
            port: 22,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self, target: &str, route: &Route) -> Result<Box<dyn Connection>, CollectError> {
        if route.mode == ConnectionMode::Local && self.local_hosts.contains(target) {
            return Ok(Box::new(LocalConnection::new(target)));
        }

        let conn = SshConnection::connect(
            target,
            self.port,
            route.credential.clone(),
            self.connect_timeout,
        )
        .await?;
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl Payload for ScheduledTaskCollector {
    type Output = HostInventory;
    type Error = CollectError;

    async fn collect(&self, target: &str, route: &Route) -> Result<HostInventory, CollectError> {
        let conn = self.connect(target, route).await?;
        let result = conn.exec(PROBE_SCRIPT).await?;

        if !result.success() && result.stdout.trim().is_empty() {
            return Err(CollectError::Probe {
                host: conn.host_name().to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }

        Ok(parse_probe_output(target, &result.stdout))
    }
}
