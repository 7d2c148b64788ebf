//! SSH client for Teltonika (RutOS) routers
//!
//! Uses `tokio::process::Command` with `sshpass` for password-based SSH.
//! A session owns an OpenSSH control master, so every command in every cycle
//! reuses one authenticated connection. The router's host key is pinned in a
//! session-private known_hosts file; unknown or changed keys are rejected.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::process::Command;

use crate::error::{MonitorError, Result};

const CONNECT_TIMEOUT_SECS: u64 = 5;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_PERSIST: &str = "10m";

// sshpass exit codes
const SSHPASS_WRONG_PASSWORD: i32 = 5;
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;
const SSHPASS_HOST_KEY_CHANGED: i32 = 7;
// ssh reports its own failures (not the remote command's) as 255
const SSH_ERROR: i32 = 255;

// ============================================================================
// Types
// ============================================================================

/// Pinned SSH host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub key_type: String,
    pub base64: String,
}

impl HostKey {
    /// Parse `AAAA...` or `ssh-rsa AAAA...`. The type is read from the blob.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();
        let (declared, encoded) = match (parts.next(), parts.next()) {
            (Some(t), Some(k)) => (Some(t), k),
            (Some(k), None) => (None, k),
            _ => return Err(MonitorError::Config("empty SSH host key".into())),
        };

        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| MonitorError::Config(format!("host key is not valid base64: {}", e)))?;

        let key_type = Self::blob_key_type(&blob).ok_or_else(|| {
            MonitorError::Config("host key is not an SSH public key blob".into())
        })?;

        if let Some(declared) = declared {
            if declared != key_type {
                return Err(MonitorError::Config(format!(
                    "host key type mismatch: declared {}, blob contains {}",
                    declared, key_type
                )));
            }
        }

        Ok(Self {
            key_type,
            base64: encoded.to_string(),
        })
    }

    /// First field of the wire format: u32 length + key type name
    fn blob_key_type(blob: &[u8]) -> Option<String> {
        let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 || len > 64 {
            return None;
        }
        let name = std::str::from_utf8(blob.get(4..4 + len)?).ok()?;
        let known = name.starts_with("ssh-") || name.starts_with("ecdsa-") || name.starts_with("sk-");
        if known && name.is_ascii() {
            Some(name.to_string())
        } else {
            None
        }
    }

    /// known_hosts line for this key
    pub fn known_hosts_line(&self, host: &str, port: u16) -> String {
        let pattern = if port == 22 {
            host.to_string()
        } else {
            format!("[{}]:{}", host, port)
        };
        format!("{} {} {}\n", pattern, self.key_type, self.base64)
    }
}

/// Where and how to log in
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub host_key: HostKey,
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .field("host_key", &self.host_key.key_type)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

// ============================================================================
// SSH Session
// ============================================================================

/// Program and leading arguments for the external commands a session runs
#[derive(Debug, Clone)]
pub struct SshCommands {
    sshpass: Vec<String>,
    ssh: Vec<String>,
}

impl Default for SshCommands {
    fn default() -> Self {
        Self {
            sshpass: vec!["sshpass".into()],
            ssh: vec!["ssh".into()],
        }
    }
}

/// An authenticated, multiplexed SSH connection to one router
pub struct SshSession {
    target: SshTarget,
    commands: SshCommands,
    workdir: PathBuf,
    state: ConnectionState,
    // The master daemonizes, so it outlives this process unless told to exit
    master_stopped: bool,
}

impl SshSession {
    /// Open the control master and verify it with a trivial command
    pub async fn connect(target: &SshTarget) -> Result<Self> {
        Self::connect_with(target, SshCommands::default()).await
    }

    async fn connect_with(target: &SshTarget, commands: SshCommands) -> Result<Self> {
        let workdir = std::env::temp_dir().join(format!(
            "teltonika-monitor-{}",
            uuid::Uuid::new_v4().simple()
        ));
        prepare_workdir(&workdir, target).await?;

        // From here on, Drop stops any master this session may have started
        let mut session = Self {
            target: target.clone(),
            commands,
            workdir,
            state: ConnectionState::Disconnected,
            master_stopped: false,
        };

        tracing::info!(
            "[TeltonikaSsh] Connecting to {}@{}:{}",
            target.user,
            target.host,
            target.port
        );

        let handshake = match session.run("echo ok", true).await {
            Ok(output) if output.contains("ok") => Ok(()),
            Ok(output) => Err(MonitorError::Unreachable(format!(
                "unexpected handshake output from {}: {}",
                target.host,
                output.trim()
            ))),
            Err(e) => Err(e),
        };

        if let Err(e) = handshake {
            session.stop_master().await;
            return Err(e);
        }

        session.state = ConnectionState::Connected;
        tracing::info!("[TeltonikaSsh] Connected to {}", target.host);
        Ok(session)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Execute a command over the session
    pub async fn exec(&mut self, command: &str) -> Result<String> {
        if self.state != ConnectionState::Connected {
            return Err(MonitorError::Unreachable("session is not connected".into()));
        }

        let result = self.run(command, false).await;
        if let Err(e) = &result {
            if e.is_connection() {
                self.state = ConnectionState::Disconnected;
            }
        }
        result
    }

    /// Stop the control master and remove session files.
    /// A dead session may still have a master running, so always ask it to exit.
    pub async fn close(mut self) {
        self.stop_master().await;
        self.state = ConnectionState::Disconnected;
        tracing::info!("[TeltonikaSsh] Session to {} closed", self.target.host);
    }

    async fn stop_master(&mut self) {
        let mut cmd = self.command(&self.commands.ssh);
        cmd.args(self.stop_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(COMMAND_TIMEOUT, cmd.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("[TeltonikaSsh] Failed to stop control master: {}", e),
            Err(_) => tracing::warn!("[TeltonikaSsh] Timed out stopping control master"),
        }
        self.master_stopped = true;
    }

    /// Blocking variant for Drop, where no runtime is available to await on
    fn stop_master_blocking(&mut self) {
        let Some((program, leading)) = self.commands.ssh.split_first() else {
            return;
        };
        let status = std::process::Command::new(program)
            .args(leading)
            .args(self.stop_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        if let Err(e) = status {
            tracing::warn!("[TeltonikaSsh] Failed to stop control master: {}", e);
        }
        self.master_stopped = true;
    }

    async fn run(&self, command: &str, establish: bool) -> Result<String> {
        let mut cmd = self.command(&self.commands.sshpass);
        // -e reads SSHPASS so the password never shows up in the process list
        cmd.arg("-e")
            .env("SSHPASS", &self.target.password)
            .arg("ssh")
            .args(self.base_args());
        if establish {
            cmd.arg("-o")
                .arg("ControlMaster=auto")
                .arg("-o")
                .arg(format!("ControlPersist={}", CONTROL_PERSIST));
        }
        cmd.arg(self.destination())
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!("[TeltonikaSsh] Executing command: {}", command);

        let output = match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MonitorError::Unreachable(format!(
                    "SSH exec failed: {} (is sshpass installed?)",
                    e
                )))
            }
            Err(_) => {
                return Err(MonitorError::Unreachable(format!(
                    "SSH command timed out after {}s",
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!("[TeltonikaSsh] STDOUT: {:?}", stdout);
        if !stderr.trim().is_empty() {
            tracing::debug!("[TeltonikaSsh] STDERR: {:?}", stderr.trim());
        }

        if output.status.success() {
            Ok(stdout)
        } else {
            Err(classify_failure(output.status.code(), &stderr))
        }
    }

    fn command(&self, argv: &[String]) -> Command {
        let (program, leading) = argv
            .split_first()
            .map(|(p, rest)| (p.as_str(), rest))
            .unwrap_or(("ssh", &[]));
        let mut cmd = Command::new(program);
        cmd.args(leading);
        cmd
    }

    fn stop_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.destination()]);
        args
    }

    fn base_args(&self) -> Vec<String> {
        let known_hosts = self.workdir.join("known_hosts");
        let control = self.workdir.join("ctl");
        vec![
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", known_hosts.display()),
            "-o".into(),
            "GlobalKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
            "-o".into(),
            "PubkeyAuthentication=no".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ControlPath={}", control.display()),
            "-p".into(),
            self.target.port.to_string(),
        ]
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // Covers failed or cancelled connects; the control socket lives in workdir
        if !self.master_stopped {
            self.stop_master_blocking();
        }
        let _ = std::fs::remove_dir_all(&self.workdir);
    }
}

async fn prepare_workdir(dir: &Path, target: &SshTarget) -> Result<()> {
    let io_err = |e: std::io::Error| {
        MonitorError::Unreachable(format!("cannot prepare SSH session directory: {}", e))
    };

    tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(io_err)?;
    }

    let line = target.host_key.known_hosts_line(&target.host, target.port);
    tokio::fs::write(dir.join("known_hosts"), line)
        .await
        .map_err(io_err)?;
    Ok(())
}

/// Map a failed sshpass/ssh invocation to an error kind
pub fn classify_failure(code: Option<i32>, stderr: &str) -> MonitorError {
    let detail = stderr.trim().to_string();
    match code {
        Some(SSHPASS_WRONG_PASSWORD) => MonitorError::Authentication(detail),
        Some(SSHPASS_HOST_KEY_UNKNOWN) | Some(SSHPASS_HOST_KEY_CHANGED) => {
            MonitorError::HostKeyRejected(detail)
        }
        Some(SSH_ERROR) => {
            if detail.contains("Host key verification failed")
                || detail.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
                || detail.contains("No matching host key")
            {
                MonitorError::HostKeyRejected(detail)
            } else if detail.contains("Permission denied") {
                MonitorError::Authentication(detail)
            } else {
                MonitorError::Unreachable(detail)
            }
        }
        None => MonitorError::Unreachable(format!("ssh terminated by signal: {}", detail)),
        Some(code) => MonitorError::Read(format!("command exited with {}: {}", code, detail)),
    }
}
