//! SSH transport.
//!
//! Uses the [`openssh`] crate (shells out to the system's OpenSSH binary) for
//! session management and [`openssh_sftp_client`] for the SFTP subsystem
//! when available.
//!
//! **SFTP fast path**: `put`/`get`/`remove` use the SFTP subsystem for
//! efficient binary-safe transfer. If the remote host does not support the
//! SFTP subsystem, the transport falls back transparently to exec-based
//! operations (`cat`, `base64`, `rm`).
//!
//! **Exec path** (always available): `exec`, `list_dir`, `stat`, `is_dir`,
//! `chmod`, `remove_tree` are implemented via remote command execution,
//! which gives structured output (GNU `stat --format=…`) and works on any
//! POSIX remote.
//!
//! This gives us full `~/.ssh/config` support, SSH agent forwarding,
//! `ControlMaster` multiplexing for fast subsequent operations, and key
//! management delegated entirely to the user's existing setup.

use async_trait::async_trait;
use bytes::Bytes;
use openssh::{Session, SessionBuilder};
use openssh_sftp_client::{Sftp, SftpOptions};
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::{
    parse_file_type, shell_escape, DirEntry, ExecResult, KnownHosts, Metadata, Transport,
    TransportError, TransportResult,
};

struct Connected {
    session: std::sync::Arc<Session>,
    sftp: Option<Sftp>,
}

/// An SSH transport to a single named host, reconnecting lazily on demand.
///
/// The session is wrapped in `Arc` so it can be shared between the exec
/// path and the SFTP subsystem (via `Sftp::from_clonable_session`).
pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    known_hosts: KnownHosts,
    state: Mutex<Option<Connected>>,
}

impl SshTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            known_hosts: KnownHosts::default(),
            state: Mutex::new(None),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_known_hosts(mut self, known_hosts: KnownHosts) -> Self {
        self.known_hosts = known_hosts;
        self
    }

    async fn ensure_connected(&self) -> TransportResult<()> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(match self.known_hosts {
            KnownHosts::Strict => openssh::KnownHosts::Strict,
            KnownHosts::AcceptNew => openssh::KnownHosts::Add,
            KnownHosts::Ignore => openssh::KnownHosts::Accept,
        });
        if let Some(user) = &self.user {
            builder.user(user.clone());
        }
        if let Some(port) = self.port {
            builder.port(port);
        }

        let session = builder
            .connect(&self.host)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        let session = std::sync::Arc::new(session);

        // Best effort — if SFTP initialisation fails we continue exec-only.
        let sftp = Sftp::from_clonable_session(session.clone(), SftpOptions::default())
            .await
            .ok();

        *guard = Some(Connected { session, sftp });
        Ok(())
    }

    async fn run(&self, program: &str, args: &[&str]) -> TransportResult<ExecResult> {
        self.ensure_connected().await?;
        let guard = self.state.lock().await;
        let connected = guard.as_ref().expect("just ensured connected");
        let mut cmd = connected.session.command(program);
        for arg in args {
            cmd.arg(arg);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| TransportError::from_ssh(&self.host, self.user.as_deref(), e))?;

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_sh(&self, script: &str) -> TransportResult<ExecResult> {
        self.run("sh", &["-c", script]).await
    }

    fn check_result(result: &ExecResult, path: &str, host: &str, user: Option<&str>) -> TransportResult<()> {
        if result.exit_code == 0 {
            return Ok(());
        }
        let stderr = result.stderr_str();
        let msg = stderr.trim();

        if msg.contains("No such file") || msg.contains("cannot access") || msg.contains("not found")
        {
            Err(TransportError::NotFound(path.to_string()))
        } else if msg.contains("Permission denied") || msg.contains("permission denied") {
            Err(TransportError::PermissionDenied(path.to_string()))
        } else if msg.is_empty() {
            Err(TransportError::RemoteError(format!(
                "command failed with exit code {} for path: {path}",
                result.exit_code
            )))
        } else {
            Err(TransportError::from_ssh(host, user, msg))
        }
    }

    fn classify_sftp_error(err: openssh_sftp_client::Error, path: &str) -> TransportError {
        let msg = err.to_string();
        if msg.contains("No such file")
            || msg.contains("not found")
            || msg.contains("does not exist")
            || msg.contains("SSH_FX_NO_SUCH_FILE")
        {
            TransportError::NotFound(path.to_string())
        } else if msg.contains("Permission denied")
            || msg.contains("permission denied")
            || msg.contains("SSH_FX_PERMISSION_DENIED")
        {
            TransportError::PermissionDenied(path.to_string())
        } else {
            TransportError::SftpError(msg)
        }
    }

    async fn put_exec(&self, path: &str, data: &[u8]) -> TransportResult<()> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let escaped = shell_escape(path);

        if let Some(parent) = Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() {
                self.run_sh(&format!("mkdir -p {}", shell_escape(&parent)))
                    .await?;
            }
        }

        let script = format!("base64 -d > {escaped} <<'__ORCH_EOF__'\n{encoded}\n__ORCH_EOF__");
        let result = self.run_sh(&script).await?;
        Self::check_result(&result, path, &self.host, self.user.as_deref())
    }

    async fn get_exec(&self, path: &str) -> TransportResult<Bytes> {
        let escaped = shell_escape(path);
        let result = self.run_sh(&format!("cat {escaped}")).await?;
        Self::check_result(&result, path, &self.host, self.user.as_deref())?;
        Ok(result.stdout)
    }

    async fn remove_exec(&self, path: &str) -> TransportResult<()> {
        let escaped = shell_escape(path);
        let result = self.run_sh(&format!("rm -f {escaped}")).await?;
        Self::check_result(&result, path, &self.host, self.user.as_deref())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.ensure_connected().await
    }

    async fn close(&self) -> TransportResult<()> {
        // `Session::close`/`Sftp::close` are async but we only hold shared
        // refs here; dropping the state drops the `Arc<Session>`, and
        // `openssh` cleans up the ControlMaster socket on drop.
        let mut guard = self.state.lock().await;
        *guard = None;
        Ok(())
    }

    async fn exec(&self, cmd: &str, args: &[&str]) -> TransportResult<ExecResult> {
        self.run(cmd, args).await
    }

    async fn list_dir(&self, path: &str) -> TransportResult<Vec<DirEntry>> {
        let escaped = shell_escape(path.trim_end_matches('/'));
        // Format: %n\t%F\t%s\t%Y\t%a — name, type, size, mtime, perms.
        let script = format!(
            r#"for f in {escaped}/* {escaped}/.*; do
  case "$(basename "$f")" in .|..) continue;; esac
  [ -e "$f" ] || [ -L "$f" ] || continue
  stat --format='%n\t%F\t%s\t%Y\t%a' "$f" 2>/dev/null
done"#
        );
        let result = self.run_sh(&script).await?;

        if result.exit_code != 0 && result.stdout.is_empty() {
            let stderr = result.stderr_str();
            if stderr.contains("No such file")
                || stderr.contains("cannot access")
                || stderr.contains("not a directory")
            {
                return Err(TransportError::NotFound(path.to_string()));
            }
        }

        let stdout = result.stdout_str();
        let mut entries = Vec::new();
        for line in stdout.lines() {
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.splitn(5, '\t').collect();
            if parts.len() < 4 {
                continue;
            }
            let full_name = parts[0];
            let name = Path::new(full_name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| full_name.to_string());
            let kind = parse_file_type(parts[1]);
            let size = parts[2].parse::<u64>().ok();
            let modified = parts[3]
                .parse::<u64>()
                .ok()
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
            let permissions = parts.get(4).and_then(|s| s.parse::<u32>().ok());

            entries.push(DirEntry {
                name,
                kind,
                size,
                modified,
                permissions,
            });
        }
        Ok(entries)
    }

    async fn make_dirs(&self, path: &str) -> TransportResult<()> {
        let escaped = shell_escape(path);
        let result = self.run_sh(&format!("mkdir -p {escaped}")).await?;
        Self::check_result(&result, path, &self.host, self.user.as_deref())
    }

    async fn put(&self, remote_path: &str, data: Bytes, executable: bool) -> TransportResult<()> {
        self.ensure_connected().await?;
        let has_sftp = {
            let guard = self.state.lock().await;
            guard.as_ref().expect("connected").sftp.is_some()
        };
        if has_sftp {
            if let Some(parent) = Path::new(remote_path).parent() {
                let parent = parent.to_string_lossy();
                if !parent.is_empty() {
                    self.make_dirs(&parent).await.ok();
                }
            }
            let guard = self.state.lock().await;
            let sftp = guard.as_ref().expect("connected").sftp.as_ref().unwrap();
            let mut fs = sftp.fs();
            match fs.write(remote_path, &data[..]).await {
                Ok(()) => {
                    drop(guard);
                    if executable {
                        self.chmod(remote_path, 0o755).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    drop(guard);
                    let classified = Self::classify_sftp_error(e, remote_path);
                    if !matches!(classified, TransportError::SftpError(_)) {
                        return Err(classified);
                    }
                    // fall through to exec path
                }
            }
        }
        self.put_exec(remote_path, &data).await?;
        if executable {
            self.chmod(remote_path, 0o755).await?;
        }
        Ok(())
    }

    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        ignore_missing: bool,
    ) -> TransportResult<()> {
        self.ensure_connected().await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TransportError::Internal(format!("creating local dir {parent:?}: {e}"))
            })?;
        }

        let has_sftp = {
            let guard = self.state.lock().await;
            guard.as_ref().expect("connected").sftp.is_some()
        };
        let data = if has_sftp {
            let guard = self.state.lock().await;
            let sftp = guard.as_ref().expect("connected").sftp.as_ref().unwrap();
            let mut fs = sftp.fs();
            match fs.read(remote_path).await {
                Ok(buf) => Some(buf.freeze()),
                Err(e) => {
                    let classified = Self::classify_sftp_error(e, remote_path);
                    match classified {
                        TransportError::NotFound(_) if ignore_missing => return Ok(()),
                        TransportError::NotFound(_) | TransportError::PermissionDenied(_) => {
                            return Err(classified);
                        }
                        _ => None, // fall through to exec path
                    }
                }
            }
        } else {
            None
        };

        let data = match data {
            Some(d) => d,
            None => match self.get_exec(remote_path).await {
                Ok(d) => d,
                Err(TransportError::NotFound(_)) if ignore_missing => return Ok(()),
                Err(e) => return Err(e),
            },
        };

        tokio::fs::write(local_path, &data)
            .await
            .map_err(|e| TransportError::Internal(format!("writing local file {local_path:?}: {e}")))
    }

    async fn open(&self, remote_path: &str, offset: u64, size: u64) -> TransportResult<Bytes> {
        let escaped = shell_escape(remote_path);
        let script = format!("tail -c +{} {escaped} | head -c {}", offset + 1, size);
        let result = self.run_sh(&script).await?;
        Self::check_result(&result, remote_path, &self.host, self.user.as_deref())?;
        Ok(result.stdout)
    }

    async fn stat(&self, path: &str) -> TransportResult<Metadata> {
        let escaped = shell_escape(path);
        let script = format!("stat --format='%F\\t%s\\t%Y\\t%a' {escaped}");
        let result = self.run_sh(&script).await?;
        Self::check_result(&result, path, &self.host, self.user.as_deref())?;

        let stdout = result.stdout_str();
        let line = stdout.trim();
        let parts: Vec<&str> = line.splitn(4, '\t').collect();
        if parts.len() < 3 {
            return Err(TransportError::RemoteError(format!(
                "unexpected stat output: {line}"
            )));
        }
        let kind = parse_file_type(parts[0]);
        let size = parts[1].parse::<u64>().unwrap_or(0);
        let modified = parts[2]
            .parse::<u64>()
            .ok()
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
        let permissions = parts.get(3).and_then(|s| s.parse::<u32>().ok());

        Ok(Metadata {
            kind,
            size,
            modified,
            permissions,
        })
    }

    async fn remove(&self, path: &str) -> TransportResult<()> {
        self.ensure_connected().await?;
        let has_sftp = {
            let guard = self.state.lock().await;
            guard.as_ref().expect("connected").sftp.is_some()
        };
        if has_sftp {
            let guard = self.state.lock().await;
            let sftp = guard.as_ref().expect("connected").sftp.as_ref().unwrap();
            let mut fs = sftp.fs();
            match fs.remove_file(path).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    drop(guard);
                    let classified = Self::classify_sftp_error(e, path);
                    if !matches!(classified, TransportError::SftpError(_)) {
                        return Err(classified);
                    }
                }
            }
        }
        self.remove_exec(path).await
    }

    async fn remove_tree(&self, path: &str) -> TransportResult<()> {
        // SFTP has no recursive remove; always shell out to `rm -rf`.
        let escaped = shell_escape(path);
        let result = self.run_sh(&format!("rm -rf {escaped}")).await?;
        if result.exit_code != 0 {
            tracing::warn!(host = %self.host, path, stderr = %result.stderr_str(), "remove_tree failed");
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> TransportResult<()> {
        let escaped = shell_escape(path);
        let result = self
            .run_sh(&format!("chmod {:o} {escaped}", mode))
            .await?;
        Self::check_result(&result, path, &self.host, self.user.as_deref())
    }

    async fn is_dir(&self, path: &str) -> TransportResult<bool> {
        let escaped = shell_escape(path);
        let result = self.run_sh(&format!("test -d {escaped}")).await?;
        Ok(result.exit_code == 0)
    }

    async fn check(&self) -> TransportResult<()> {
        let result = self.run("true", &[]).await?;
        if result.exit_code == 0 {
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed {
                host: self.host.clone(),
                reason: "health check failed: `true` returned non-zero".to_string(),
            })
        }
    }

    fn description(&self) -> String {
        format!("ssh:{}", self.host)
    }
}
