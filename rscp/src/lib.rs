//! Resumable, integrity-verified file transfers over SFTP - `rscp`
//!
//! # Usage
//!
//! ```bash
//! # Upload a file, resuming a previously interrupted attempt
//! rscp upload -H server.example.com ./backup.tar.gz /srv/backups/
//!
//! # Download a whole directory with progress bars
//! rscp download -H server.example.com -p 2222 -U deploy /var/log/app ./logs --progress
//!
//! # Check connectivity and host trust
//! rscp test -H server.example.com
//! ```
//!
//! # Transfer Semantics
//!
//! - Data is written to `<destination>.part` and renamed into place once complete.
//! - A `.part` file smaller than the source is resumed from its current size; anything else
//!   starts over.
//! - After each file the MD5 digests of both sides are compared (`md5sum` runs on the remote
//!   host). A mismatch fails the transfer and is never retried.
//! - Transient network failures (connection reset, refused, timeouts, ...) re-run the whole
//!   operation with exponential backoff: 1s, 2s, 4s, ... capped at 30s.
//! - A destination that is an existing directory, or ends with `/`, receives the source under its
//!   own name.
//!
//! # Host Keys
//!
//! Host keys are checked against `~/.ssh/known_hosts`. An unknown host is prompted for on the
//! terminal and recorded once accepted; `--host-key-policy accept-new` records it without asking
//! and `--host-key-policy strict` refuses it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::instrument;

use common::TransferConfig;
use common::fs::{LocalFs, blocking};
use common::progress::Progress;
use common::retry::{RetryConfig, with_retry};
use common::transfer::{self, Direction, Summary};

static PROGRESS: LazyLock<Progress> = LazyLock::new(Progress::new);

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct Remote {
    pub endpoint: remote::Endpoint,
    pub known_hosts: PathBuf,
    pub policy: remote::TrustPolicy,
}

impl Remote {
    /// Uses `~/.ssh/known_hosts` and the interactive trust policy
    pub fn new(endpoint: remote::Endpoint) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint,
            known_hosts: remote::KnownHosts::default_path()?,
            policy: remote::TrustPolicy::default(),
        })
    }

    fn verifier(&self) -> remote::HostVerifier {
        remote::HostVerifier::new(remote::KnownHosts::new(&self.known_hosts), self.policy)
    }

    /// Opens an authenticated session with the host key verified
    pub async fn connect(&self) -> anyhow::Result<remote::Session> {
        let remote = self.clone();
        blocking(move || remote::Session::connect(&remote.endpoint, &remote.verifier())).await
    }
}

async fn attempt(
    remote: &Remote,
    config: &TransferConfig,
    direction: Direction,
    src: &Path,
    dst: &Path,
) -> anyhow::Result<Summary> {
    let session = Arc::new(remote.connect().await?);
    let sftp = {
        let session = session.clone();
        Arc::new(blocking(move || session.sftp()).await?)
    };
    let summary = match direction {
        Direction::Upload => {
            let ctx = transfer::Context::new(
                Arc::new(LocalFs),
                sftp,
                session,
                direction,
                *config,
                &PROGRESS,
            );
            transfer::transfer(&ctx, src, dst).await?
        }
        Direction::Download => {
            let ctx = transfer::Context::new(
                sftp,
                Arc::new(LocalFs),
                session,
                direction,
                *config,
                &PROGRESS,
            );
            transfer::transfer(&ctx, src, dst).await?
        }
    };
    Ok(summary)
}

/// Runs one direction of a transfer, reconnecting and resuming on every retry
async fn run(
    remote: &Remote,
    config: &TransferConfig,
    retry: &RetryConfig,
    direction: Direction,
    src: &Path,
    dst: &Path,
) -> anyhow::Result<Summary> {
    config.validate().map_err(|error| anyhow::anyhow!(error))?;
    let summary = with_retry(retry, || attempt(remote, config, direction, src, dst)).await?;
    tracing::info!("{}: {}", direction, PROGRESS.status_line());
    Ok(summary)
}

/// Copies local `local` (file or directory) to `remote_path` on the remote host
#[instrument(skip(remote, config, retry))]
pub async fn upload(
    remote: &Remote,
    config: &TransferConfig,
    retry: &RetryConfig,
    local: &Path,
    remote_path: &Path,
) -> anyhow::Result<Summary> {
    run(remote, config, retry, Direction::Upload, local, remote_path).await
}

/// Copies `remote_path` (file or directory) on the remote host to local `local`
#[instrument(skip(remote, config, retry))]
pub async fn download(
    remote: &Remote,
    config: &TransferConfig,
    retry: &RetryConfig,
    remote_path: &Path,
    local: &Path,
) -> anyhow::Result<Summary> {
    run(remote, config, retry, Direction::Download, remote_path, local).await
}

/// Connects and starts SFTP, returning the address that was reached
#[instrument(skip(remote))]
pub async fn test_connection(remote: &Remote) -> anyhow::Result<String> {
    let session = remote.connect().await?;
    let address = session.address().to_string();
    blocking(move || session.sftp().map(|_| ())).await?;
    Ok(address)
}
