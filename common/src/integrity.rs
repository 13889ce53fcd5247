//! End-to-end MD5 check of a transferred file.
//!
//! The local digest is computed in-process, the remote one by running `md5sum` on the remote
//! host through a [`CommandRunner`].

use anyhow::Context;
use md5::{Digest, Md5};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    /// stdout followed by stderr
    pub output: String,
}

pub trait CommandRunner: Send + Sync + 'static {
    fn execute(&self, command: &str) -> anyhow::Result<CommandOutput>;
}

/// Failures of the integrity check. Both are final: retrying the transfer cannot fix them.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("checksum mismatch: local={local}, remote={remote}")]
    Mismatch { local: String, remote: String },
    #[error("failed to compute remote checksum of {path:?}: {reason}")]
    RemoteDigest { path: PathBuf, reason: String },
}

pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn md5_command(path: &Path) -> String {
    format!("md5sum {}", shell_escape(&path.to_string_lossy()))
}

/// Takes the digest from `md5sum` output: the first token, 32 hex digits
pub fn parse_md5_output(output: &str) -> Option<String> {
    let digest = output.split_whitespace().next()?;
    if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(digest.to_ascii_lowercase())
}

pub fn local_md5(path: &Path) -> anyhow::Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("cannot open {path:?} for hashing"))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error).with_context(|| format!("failed hashing {path:?}")),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn remote_md5(runner: &dyn CommandRunner, path: &Path) -> anyhow::Result<String> {
    let command = md5_command(path);
    tracing::debug!("running: {command}");
    let result = runner
        .execute(&command)
        .with_context(|| format!("failed running {command:?}"))?;
    if result.status != 0 {
        return Err(IntegrityError::RemoteDigest {
            path: path.to_path_buf(),
            reason: format!(
                "md5sum exited with status {}: {}",
                result.status,
                result.output.trim()
            ),
        }
        .into());
    }
    parse_md5_output(&result.output).ok_or_else(|| {
        IntegrityError::RemoteDigest {
            path: path.to_path_buf(),
            reason: format!("unexpected md5sum output: {:?}", result.output.trim()),
        }
        .into()
    })
}

/// Compares the digests of `local` and `remote`, returning the (shared) digest
pub fn verify(
    runner: &dyn CommandRunner,
    local: &Path,
    remote: &Path,
) -> anyhow::Result<String> {
    let local_digest = local_md5(local)?;
    let remote_digest = remote_md5(runner, remote)?;
    if local_digest != remote_digest {
        return Err(IntegrityError::Mismatch {
            local: local_digest,
            remote: remote_digest,
        }
        .into());
    }
    tracing::debug!("checksum {local_digest} matches for {local:?} and {remote:?}");
    Ok(local_digest)
}
