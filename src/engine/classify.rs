// Target classification: local vs remote transport

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::credential::Credential;

/// How a payload reaches its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// In-process, on this machine
    Local,
    /// Through the remote transport (SSH)
    Remote,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Local => write!(f, "local"),
            ConnectionMode::Remote => write!(f, "remote"),
        }
    }
}

/// Names and addresses that refer to this machine
///
/// Built once at startup and read-only for the rest of the run. Lookups are
/// ASCII case-insensitive and ignore a trailing DNS root dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalHostSet {
    names: BTreeSet<String>,
}

impl LocalHostSet {
    /// Loopback aliases only, no resolver lookups
    pub fn loopback() -> Self {
        let mut set = LocalHostSet::default();
        for alias in ["localhost", "127.0.0.1", "::1", "."] {
            set.insert(alias);
        }
        set
    }

    /// Loopback aliases plus this machine's hostname and the addresses it
    /// resolves to
    pub fn discover() -> Self {
        let mut set = Self::loopback();

        let hostname = match dns_lookup::get_hostname() {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(error = %e, "could not read local hostname");
                return set;
            }
        };

        set.insert(&hostname);
        if let Some((short, _)) = hostname.split_once('.') {
            set.insert(short);
        }

        match dns_lookup::lookup_host(&hostname) {
            Ok(addrs) => {
                for addr in addrs {
                    set.insert(&addr.to_string());
                }
            }
            Err(e) => {
                tracing::debug!(hostname = %hostname, error = %e, "local hostname did not resolve");
            }
        }

        tracing::debug!(count = set.len(), "discovered local host set");
        set
    }

    pub fn insert(&mut self, name: &str) {
        let key = normalize(name);
        if !key.is_empty() {
            self.names.insert(key);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&normalize(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for LocalHostSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = LocalHostSet::default();
        for name in iter {
            set.insert(name.as_ref());
        }
        set
    }
}

fn normalize(name: &str) -> String {
    let trimmed = name.trim();
    let trimmed = if trimmed.len() > 1 {
        trimmed.trim_end_matches('.')
    } else {
        trimmed
    };
    trimmed.to_ascii_lowercase()
}

/// Decide whether `target` needs the remote transport
///
/// The override flag wins outright. Otherwise a target goes remote only when it
/// is not one of the local names and a non-empty credential was supplied.
pub fn classify(
    target: &str,
    force_remote: bool,
    credential: Option<&Credential>,
    local_hosts: &LocalHostSet,
) -> ConnectionMode {
    if force_remote {
        return ConnectionMode::Remote;
    }

    let has_credential = credential.is_some_and(|c| !c.is_empty());
    if has_credential && !local_hosts.contains(target) {
        ConnectionMode::Remote
    } else {
        ConnectionMode::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_without_credential_is_local() {
        let local = LocalHostSet::loopback();
        assert_eq!(classify("127.0.0.1", false, None, &local), ConnectionMode::Local);
        assert_eq!(classify("localhost", false, None, &local), ConnectionMode::Local);
    }

    #[test]
    fn test_remote_name_with_credential_is_remote() {
        let local = LocalHostSet::loopback();
        let cred = Credential::new("admin").with_password("secret");
        assert_eq!(
            classify("db01.example.com", false, Some(&cred), &local),
            ConnectionMode::Remote
        );
    }

    #[test]
    fn test_remote_name_without_credential_stays_local() {
        // No credential means the payload is asked to run in-process
        let local = LocalHostSet::loopback();
        assert_eq!(
            classify("db01.example.com", false, None, &local),
            ConnectionMode::Local
        );
        let empty = Credential::default();
        assert_eq!(
            classify("db01.example.com", false, Some(&empty), &local),
            ConnectionMode::Local
        );
    }

    #[test]
    fn test_local_name_with_credential_is_local() {
        let local = LocalHostSet::loopback();
        let cred = Credential::new("admin");
        assert_eq!(classify("LOCALHOST", false, Some(&cred), &local), ConnectionMode::Local);
    }

    #[test]
    fn test_override_forces_remote_everywhere() {
        let local = LocalHostSet::loopback();
        for target in ["localhost", "127.0.0.1", "::1", "web01"] {
            assert_eq!(classify(target, true, None, &local), ConnectionMode::Remote);
        }
    }

    #[test]
    fn test_set_normalizes_names() {
        let set: LocalHostSet = ["Build-Box.corp.", "10.0.0.5"].into_iter().collect();
        assert!(set.contains("build-box.corp"));
        assert!(set.contains(" 10.0.0.5 "));
        assert!(!set.contains("build-box"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_discover_includes_loopback() {
        let set = LocalHostSet::discover();
        assert!(set.contains("localhost"));
        assert!(set.contains("127.0.0.1"));
    }
}
