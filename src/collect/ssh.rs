// SSH transport for remote collection

use async_trait::async_trait;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ssh2::{KeyboardInteractivePrompt, Session};

use super::{CollectError, CommandResult, Connection};
use crate::engine::Credential;

/// An authenticated SSH session to one host
pub struct SshConnection {
    session: Arc<Mutex<Session>>,
    host_name: String,
}

impl SshConnection {
    /// Connect and authenticate, off the async runtime
    ///
    /// Authentication tries the SSH agent, then key files (the credential's key
    /// first, then `~/.ssh/id_ed25519` and `~/.ssh/id_rsa`), then the
    /// credential's password with keyboard-interactive as a fallback.
    pub async fn connect(
        host: &str,
        port: u16,
        credential: Option<Credential>,
        connect_timeout: Duration,
    ) -> Result<Self, CollectError> {
        let host_name = host.to_string();
        let task_host = host_name.clone();

        tokio::task::spawn_blocking(move || {
            connect_blocking(&task_host, port, credential.as_ref(), connect_timeout)
        })
        .await
        .map_err(|e| CollectError::Connect {
            host: host_name,
            message: format!("connect task failed: {}", e),
        })?
    }
}

fn connect_blocking(
    host: &str,
    port: u16,
    credential: Option<&Credential>,
    connect_timeout: Duration,
) -> Result<SshConnection, CollectError> {
    let connect_err = |message: String| CollectError::Connect {
        host: host.to_string(),
        message,
    };

    let address = (host, port)
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("cannot resolve address: {}", e)))?
        .next()
        .ok_or_else(|| connect_err("address resolved to nothing".to_string()))?;

    let tcp = TcpStream::connect_timeout(&address, connect_timeout)
        .map_err(|e| connect_err(format!("connection failed: {}", e)))?;

    let mut session =
        Session::new().map_err(|e| connect_err(format!("failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_ms(connect_timeout));
    session
        .handshake()
        .map_err(|e| connect_err(format!("SSH handshake failed: {}", e)))?;

    let user = credential
        .map(|c| c.user.clone())
        .filter(|u| !u.is_empty())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string());

    if !authenticate(&session, &user, credential) {
        return Err(CollectError::Auth {
            host: host.to_string(),
            user,
        });
    }

    // Handshake timeout only; long probes are bounded by the engine's timeout
    session.set_timeout(0);

    tracing::debug!(host = %host, user = %user, "ssh session established");

    Ok(SshConnection {
        session: Arc::new(Mutex::new(session)),
        host_name: host.to_string(),
    })
}

/// libssh2 takes milliseconds as u32; saturate instead of wrapping
fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn authenticate(session: &Session, user: &str, credential: Option<&Credential>) -> bool {
    if let Ok(mut agent) = session.agent() {
        if agent.connect().is_ok() {
            agent.list_identities().ok();
            for identity in agent.identities().unwrap_or_default() {
                if agent.userauth(user, &identity).is_ok() {
                    return true;
                }
            }
        }
    }

    for key_path in key_candidates(credential) {
        if key_path.exists()
            && session
                .userauth_pubkey_file(user, None, &key_path, None)
                .is_ok()
        {
            return true;
        }
    }

    if let Some(password) = credential.and_then(Credential::password) {
        if session.userauth_password(user, password).is_ok() {
            return true;
        }
        // Some PAM setups only offer keyboard-interactive
        let mut prompter = PasswordPrompter(password.to_string());
        if session
            .userauth_keyboard_interactive(user, &mut prompter)
            .is_ok()
        {
            return true;
        }
    }

    session.authenticated()
}

fn key_candidates(credential: Option<&Credential>) -> Vec<PathBuf> {
    credential
        .and_then(|c| c.private_key.clone())
        .into_iter()
        .chain(
            ["id_ed25519", "id_rsa"]
                .iter()
                .filter_map(|name| dirs::home_dir().map(|h| h.join(".ssh").join(name))),
        )
        .collect()
}

fn exec_blocking(session: &Session, host: &str, command: &str) -> Result<CommandResult, CollectError> {
    let exec_err = |message: String| CollectError::Exec {
        host: host.to_string(),
        message,
    };

    let mut channel = session
        .channel_session()
        .map_err(|e| exec_err(format!("failed to open channel: {}", e)))?;
    channel
        .exec(command)
        .map_err(|e| exec_err(format!("failed to execute command: {}", e)))?;

    let stdout = read_lossy(&mut channel)
        .map_err(|e| exec_err(format!("failed to read stdout: {}", e)))?;
    let stderr = read_lossy(&mut channel.stderr())
        .map_err(|e| exec_err(format!("failed to read stderr: {}", e)))?;

    channel.wait_close().ok();
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
    })
}

/// Read everything, replacing invalid UTF-8 instead of failing on it
fn read_lossy<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, CollectError> {
        let session = self.session.clone();
        let host = self.host_name.clone();
        let command = cmd.to_string();

        tokio::task::spawn_blocking(move || exec_blocking(&session.lock(), &host, &command))
            .await
            .map_err(|e| CollectError::Exec {
                host: self.host_name.clone(),
                message: format!("exec task failed: {}", e),
            })?
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

/// Simple home directory lookup
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}
