// Scan configuration and target list loading

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::Credential;
use crate::output::errors::ScanError;

/// Upper bound for the number of concurrent contexts
pub const MAX_THROTTLE_LIMIT: usize = 65535;

/// Configuration for a scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Maximum concurrent jobs (pool size)
    pub throttle_limit: usize,
    /// Per-job timeout; `None` waits forever
    pub timeout: Option<Duration>,
    /// Sleep between drain passes
    pub poll_interval: Duration,
    /// Route every target through the remote transport
    pub force_remote: bool,
    /// Credential for the remote transport
    pub credential: Option<Credential>,
    /// Emit progress after each drain pass
    pub show_progress: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            throttle_limit: 32,
            timeout: None,
            poll_interval: Duration::from_millis(100),
            force_remote: false,
            credential: None,
            show_progress: false,
        }
    }
}

impl ScanConfig {
    pub fn with_throttle_limit(mut self, limit: usize) -> Self {
        self.throttle_limit = limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_force_remote(mut self, force: bool) -> Self {
        self.force_remote = force;
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ScanError> {
        check_throttle_limit(self.throttle_limit)?;

        if self.poll_interval.is_zero() {
            return Err(ScanError::config("poll interval must be greater than zero"));
        }

        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ScanError::Config {
                message: "timeout must be greater than zero".to_string(),
                suggestion: Some("Omit --timeout to wait for every host".to_string()),
            });
        }

        Ok(())
    }
}

/// Reject a pool size outside `1..=MAX_THROTTLE_LIMIT`
pub fn check_throttle_limit(limit: usize) -> Result<(), ScanError> {
    if (1..=MAX_THROTTLE_LIMIT).contains(&limit) {
        return Ok(());
    }

    Err(ScanError::Config {
        message: format!(
            "throttle limit {} is outside the allowed range 1..={}",
            limit, MAX_THROTTLE_LIMIT
        ),
        suggestion: Some(format!(
            "Pass --throttle-limit with a value between 1 and {}",
            MAX_THROTTLE_LIMIT
        )),
    })
}

/// Scan settings read from a YAML file
///
/// ```yaml
/// hosts:
///   - web01
///   - db01.example.com
/// throttle_limit: 16
/// timeout_secs: 30
/// user: ops
/// private_key: ~/.ssh/id_ed25519
/// port: 22
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanFile {
    pub hosts: Vec<String>,
    pub throttle_limit: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub user: Option<String>,
    pub private_key: Option<PathBuf>,
    pub port: Option<u16>,
}

impl ScanFile {
    pub fn from_file(path: &Path) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path).map_err(|e| ScanError::Io {
            message: format!("Failed to read config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        Self::from_str_named(&content, &path.display().to_string())
    }

    fn from_str_named(content: &str, name: &str) -> Result<Self, ScanError> {
        serde_yaml::from_str(content).map_err(|e| ScanError::Parse {
            message: format!("Invalid config file: {}", e),
            file: Some(name.to_string()),
            line: e.location().map(|l| l.line()),
        })
    }
}

/// Split a comma-separated host list
pub fn parse_host_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read a hosts file: one target per line, `#` starts a comment
pub fn read_hosts_file(path: &Path) -> Result<Vec<String>, ScanError> {
    let content = std::fs::read_to_string(path).map_err(|e| ScanError::Io {
        message: format!("Failed to read hosts file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    Ok(parse_hosts(&content))
}

fn parse_hosts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .flat_map(|line| line.split_whitespace())
        .map(str::to_string)
        .collect()
}

/// Remove duplicate targets, keeping first-seen order
///
/// Targets compare case-insensitively, since host names do.
pub fn dedupe_targets<I>(targets: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert(t.to_ascii_lowercase()))
        .collect()
}
