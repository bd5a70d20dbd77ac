//! The transfer service: delivers a materialised result file to its final
//! destination, either a local directory or a remote host over SCP.
//!
//! `ssh2` is a blocking library, so every SSH operation here runs on the
//! blocking thread pool via [`tokio::task::spawn_blocking`] rather than
//! inline on the worker's async task.

use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ssh2::Session;

use crate::config::SshDefaults;
use crate::error::TransferError;
use crate::models::{Query, ResolvedDestination, UserSettings};
use crate::secret::Redacted;

const TRANSFER_RETRY_ATTEMPTS: u32 = 3;
const TRANSFER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Resolved SSH connection parameters, precedence already applied.
#[derive(Clone, Debug)]
struct SshTarget {
    host: String,
    port: u16,
    username: String,
    password: Option<Redacted<String>>,
    key: Option<Redacted<String>>,
    key_passphrase: Option<Redacted<String>>,
    timeout: Duration,
}

pub struct TransferService {
    defaults: SshDefaults,
}

impl TransferService {
    pub fn new(defaults: SshDefaults) -> Self {
        Self { defaults }
    }

    /// Resolve whether `query`/`settings` ask for a remote SCP transfer or a
    /// local copy, per the precedence rules in the destination resolution
    /// step: `Query.ssh_hostname` > `UserSettings.ssh_hostname` > configured
    /// default host. A configured default host means every transfer goes
    /// remote unless a query explicitly has no hostname anywhere *and* no
    /// default is configured.
    fn resolve_target(&self, query: &Query, settings: Option<&UserSettings>) -> Option<SshTarget> {
        let host = query
            .ssh_hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| settings.and_then(|s| s.ssh_hostname.clone()).filter(|h| !h.is_empty()))
            .or_else(|| Some(self.defaults.host.clone()).filter(|h| !h.is_empty()))?;

        let (username, password, key, key_passphrase, port) = match settings {
            Some(s) if !s.ssh_username.as_deref().unwrap_or("").is_empty() => (
                s.ssh_username.clone().unwrap_or_default(),
                s.ssh_password.clone(),
                s.ssh_key.clone(),
                s.ssh_key_passphrase.clone(),
                u16::try_from(s.ssh_port).unwrap_or(self.defaults.port),
            ),
            _ => (
                self.defaults.username.clone(),
                self.defaults.password.clone(),
                self.defaults.key.clone(),
                self.defaults.key_passphrase.clone(),
                self.defaults.port,
            ),
        };

        Some(SshTarget {
            host,
            port,
            username,
            password,
            key,
            key_passphrase,
            timeout: self.defaults.timeout(),
        })
    }

    /// Deliver `tmp_path` to `destination`, retrying up to 3 times with a
    /// fixed 2s delay. Permission-denied failures are not retried.
    pub async fn deliver(
        &self,
        tmp_path: &Path,
        destination: &ResolvedDestination,
        query: &Query,
        settings: Option<&UserSettings>,
    ) -> Result<(), TransferError> {
        let target = self.resolve_target(query, settings);
        let tmp_path = tmp_path.to_owned();
        let final_path = destination.final_path();

        let mut last_err = None;

        for attempt in 1..=TRANSFER_RETRY_ATTEMPTS {
            let tmp_path = tmp_path.clone();
            let final_path = final_path.clone();
            let target = target.clone();

            let outcome = tokio::task::spawn_blocking(move || {
                transfer_once(&tmp_path, &final_path, target.as_ref())
            })
            .await
            .context("transfer task panicked");

            let error = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(e) => TransferError::Transient { source: e },
            };

            // Permission denial is terminal: the remote end will keep
            // refusing no matter how many times we retry.
            if !error.is_retryable() {
                return Err(error);
            }

            tracing::warn!(%error, attempt, "transfer attempt failed");
            last_err = Some(error);

            if attempt < TRANSFER_RETRY_ATTEMPTS {
                tokio::time::sleep(TRANSFER_RETRY_DELAY).await;
            }
        }

        Err(last_err.expect("loop runs at least once"))
    }

    /// Best-effort cleanup of the tmp file, run regardless of transfer
    /// outcome.
    pub fn cleanup_tmp(&self, tmp_path: &Path) {
        if let Err(error) = std::fs::remove_file(tmp_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(%error, path = %tmp_path.display(), "failed to clean up tmp file");
            }
        }
    }
}

fn transfer_once(
    tmp_path: &Path,
    final_path: &str,
    target: Option<&SshTarget>,
) -> Result<(), TransferError> {
    match target {
        None => local_copy(tmp_path, final_path).map_err(|source| TransferError::Transient { source }),
        Some(target) => remote_scp(tmp_path, final_path, target),
    }
}

fn local_copy(tmp_path: &Path, final_path: &str) -> anyhow::Result<()> {
    let final_path = Path::new(final_path);
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create destination directory {}", parent.display()))?;
    }

    std::fs::copy(tmp_path, final_path).with_context(|| {
        format!(
            "failed to copy {} to {}",
            tmp_path.display(),
            final_path.display()
        )
    })?;

    Ok(())
}

fn remote_scp(tmp_path: &Path, final_path: &str, target: &SshTarget) -> Result<(), TransferError> {
    let session = open_session(target).map_err(|source| classify(source))?;

    let remote_dir = Path::new(final_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    run_command(&session, &format!("mkdir -p \"{remote_dir}\""))
        .map_err(|source| classify(source))?;

    let mut local_file = std::fs::File::open(tmp_path)
        .with_context(|| format!("failed to open tmp file {}", tmp_path.display()))
        .map_err(|source| TransferError::Transient { source })?;
    let metadata = local_file
        .metadata()
        .context("failed to read tmp file metadata")
        .map_err(|source| TransferError::Transient { source })?;

    let mut remote_file = session
        .scp_send(Path::new(final_path), 0o644, metadata.len(), None)
        .context("failed to open remote SCP channel")
        .map_err(|source| classify(source))?;

    let mut buf = Vec::new();
    local_file
        .read_to_end(&mut buf)
        .context("failed to read tmp file")
        .map_err(|source| TransferError::Transient { source })?;
    std::io::Write::write_all(&mut remote_file, &buf)
        .context("failed to stream file over SCP")
        .map_err(|source| classify(source))?;

    remote_file.send_eof().ok();
    remote_file.wait_eof().ok();
    remote_file.close().ok();
    remote_file.wait_close().ok();

    run_command(&session, &format!("ls -l \"{final_path}\""))
        .map_err(|source| classify(source))?;
    run_command(&session, &format!("chmod 644 \"{final_path}\""))
        .map_err(|source| classify(source))?;

    Ok(())
}

fn open_session(target: &SshTarget) -> anyhow::Result<Session> {
    let addr = format!("{}:{}", target.host, target.port);
    let tcp = TcpStream::connect(&addr).with_context(|| format!("failed to connect to {addr}"))?;
    tcp.set_read_timeout(Some(target.timeout)).ok();
    tcp.set_write_timeout(Some(target.timeout)).ok();

    let mut session = Session::new().context("failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;

    if let Some(key) = &target.key {
        let mut key_file =
            tempfile::NamedTempFile::new().context("failed to create temporary key file")?;
        std::io::Write::write_all(&mut key_file, key.expose().as_bytes())
            .context("failed to write temporary key file")?;

        session
            .userauth_pubkey_file(
                &target.username,
                None,
                key_file.path(),
                target.key_passphrase.as_ref().map(|p| p.expose().as_str()),
            )
            .context("SSH key authentication failed")?;
    } else if let Some(password) = &target.password {
        session
            .userauth_password(&target.username, password.expose())
            .context("SSH password authentication failed")?;
    } else {
        anyhow::bail!("no SSH credentials configured (neither key nor password)");
    }

    if !session.authenticated() {
        anyhow::bail!("SSH authentication did not succeed");
    }

    Ok(session)
}

fn run_command(session: &Session, command: &str) -> anyhow::Result<String> {
    let mut channel = session
        .channel_session()
        .context("failed to open SSH command channel")?;
    channel
        .exec(command)
        .with_context(|| format!("failed to execute remote command `{command}`"))?;

    let mut output = String::new();
    channel
        .read_to_string(&mut output)
        .context("failed to read remote command output")?;
    channel.wait_close().ok();

    let status = channel.exit_status().unwrap_or(-1);
    if status != 0 {
        anyhow::bail!("remote command `{command}` exited with status {status}: {output}");
    }

    Ok(output)
}

fn classify(source: anyhow::Error) -> TransferError {
    let message = source.to_string().to_lowercase();
    if message.contains("permission denied") {
        TransferError::PermissionDenied { source }
    } else {
        TransferError::Transient { source }
    }
}

/// Where the tmp export root lives and how it is emptied once every file
/// it held has been delivered.
pub struct TmpRoot {
    root: PathBuf,
}

impl TmpRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create tmp export root {}", self.root.display()))
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults(host: &str) -> SshDefaults {
        SshDefaults {
            host: host.to_string(),
            port: 22,
            username: "deploy".to_string(),
            password: Some(Redacted::new("envpass".to_string())),
            key: None,
            key_passphrase: None,
            known_hosts: None,
            timeout_seconds: 30,
            keepalive_interval_seconds: 30,
        }
    }

    fn bare_query(id: i64, user_id: i64) -> Query {
        Query {
            id,
            user_id,
            query_text: "select 1".to_string(),
            db_username: "db".to_string(),
            db_password: Redacted::new(String::new()),
            db_tns: "host".to_string(),
            export_location: None,
            export_type: None,
            export_filename: None,
            ssh_hostname: None,
            status: crate::models::QueryStatus::Pending,
            error_message: None,
            result_metadata: sqlx::types::Json(serde_json::json!({})),
            created_at: chrono::Utc::now(),
            started_at: None,
            updated_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn query_hostname_overrides_user_settings_and_default() {
        let service = TransferService::new(defaults("default-host"));
        let mut query = bare_query(1, 1);
        query.ssh_hostname = Some("query-host".to_string());

        let target = service.resolve_target(&query, None).unwrap();
        assert_eq!(target.host, "query-host");
    }

    #[test]
    fn falls_back_to_configured_default_host() {
        let service = TransferService::new(defaults("default-host"));
        let query = bare_query(1, 1);

        let target = service.resolve_target(&query, None).unwrap();
        assert_eq!(target.host, "default-host");
    }

    #[test]
    fn empty_default_host_means_local_copy() {
        let service = TransferService::new(defaults(""));
        let query = bare_query(1, 1);

        assert!(service.resolve_target(&query, None).is_none());
    }

    #[tokio::test]
    async fn local_copy_mode_delivers_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_path = dir.path().join("source.csv");
        std::fs::write(&tmp_path, b"a,b\n1,2\n").unwrap();

        let final_dir = dir.path().join("dest");
        let destination = ResolvedDestination {
            export_type: crate::models::ExportType::Csv,
            directory: final_dir.to_string_lossy().into_owned(),
            filename: "out.csv".to_string(),
        };

        let service = TransferService::new(defaults(""));
        let query = bare_query(1, 1);

        service
            .deliver(&tmp_path, &destination, &query, None)
            .await
            .unwrap();

        let written = std::fs::read(final_dir.join("out.csv")).unwrap();
        assert_eq!(written, b"a,b\n1,2\n");
    }

    #[test]
    fn classifies_permission_denied_messages() {
        let err = classify(anyhow::anyhow!("scp: Permission denied"));
        assert!(matches!(err, TransferError::PermissionDenied { .. }));

        let err = classify(anyhow::anyhow!("connection reset by peer"));
        assert!(matches!(err, TransferError::Transient { .. }));
    }
}
