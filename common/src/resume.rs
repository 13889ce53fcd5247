//! Staging and resume of interrupted transfers.
//!
//! Data is always written to `<dst>.part`. An existing part file shorter than the source is
//! taken to hold a correct prefix of it and the copy continues at its size. The prefix is not
//! re-checked here; a bad prefix surfaces only in the integrity check after the copy.

use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::fs::FileService;

pub const PART_SUFFIX: &str = ".part";

pub fn staging_path(dst: &Path) -> PathBuf {
    let mut staging = dst.as_os_str().to_owned();
    staging.push(PART_SUFFIX);
    PathBuf::from(staging)
}

/// Offset to continue from given the size of an existing part file (if any)
pub fn resume_offset(staged: Option<u64>, total: u64) -> u64 {
    match staged {
        Some(size) if size < total => size,
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub staging: PathBuf,
    pub offset: u64,
    pub total: u64,
}

impl Plan {
    pub fn is_resume(&self) -> bool {
        self.offset > 0
    }

    /// A fresh transfer must not inherit stale bytes from a longer part file
    pub fn truncate(&self) -> bool {
        self.offset == 0
    }

    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.offset as f64 * 100.0 / self.total as f64
    }
}

pub fn plan<D: FileService>(dst_fs: &D, dst: &Path, total: u64) -> anyhow::Result<Plan> {
    let staging = staging_path(dst);
    let staged = dst_fs
        .stat(&staging)
        .with_context(|| format!("failed checking for partial transfer at {staging:?}"))?
        .filter(|stat| !stat.is_dir)
        .map(|stat| stat.size);
    let plan = Plan {
        offset: resume_offset(staged, total),
        staging,
        total,
    };
    if plan.is_resume() {
        tracing::info!(
            "resuming from {} bytes ({:.2}%)",
            plan.offset,
            plan.percent_done()
        );
    } else if let Some(size) = staged {
        tracing::debug!("discarding part file of {size} bytes, source is {total} bytes");
    }
    Ok(plan)
}

/// Moves the finished part file over the final destination
pub fn commit<D: FileService>(dst_fs: &D, plan: &Plan, dst: &Path) -> anyhow::Result<()> {
    if let Err(error) = dst_fs.remove(dst) {
        tracing::debug!("nothing removed at destination: {:#}", &error);
    }
    dst_fs
        .rename(&plan.staging, dst)
        .with_context(|| format!("failed moving {:?} into place", &plan.staging))
}
