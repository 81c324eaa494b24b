// Credentials handed to the remote transport

use std::fmt;
use std::path::PathBuf;

use zeroize::Zeroizing;

/// Secret bundle used to reach a remote target
///
/// A credential is either empty (nothing supplied on the command line) or
/// present. Presence alone is what routes a non-local target to the remote
/// transport; the engine never inspects the secret itself.
#[derive(Clone, Default)]
pub struct Credential {
    pub user: String,
    password: Option<Zeroizing<String>>,
    pub private_key: Option<PathBuf>,
}

impl Credential {
    pub fn new(user: impl Into<String>) -> Self {
        Credential {
            user: user.into(),
            password: None,
            private_key: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }

    /// True when no user, password or key was supplied
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_none() && self.private_key.is_none()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        assert!(Credential::default().is_empty());
        assert!(!Credential::new("ops").is_empty());
        assert!(!Credential::default().with_password("x").is_empty());
    }

    #[test]
    fn test_debug_redacts_password() {
        let cred = Credential::new("ops").with_password("hunter2");
        let rendered = format!("{:?}", cred);
        assert!(rendered.contains("ops"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(cred.password(), Some("hunter2"));
    }
}
