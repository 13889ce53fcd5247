use anyhow::{Context as _, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use crate::chunker::{self, FirstError};
use crate::config::TransferConfig;
use crate::fs::{FileService, FileStat, blocking};
use crate::integrity::{self, CommandRunner};
use crate::progress;
use crate::resume;

/// Error type for transfer operations that preserves the operation summary even on failure.
///
/// The Display implementation shows the full error chain of the source.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

impl Direction {
    /// (local, remote) sides of a finished file, used for the integrity check
    fn sides<'a>(&self, src: &'a Path, dst: &'a Path) -> (&'a Path, &'a Path) {
        match self {
            Direction::Upload => (src, dst),
            Direction::Download => (dst, src),
        }
    }
}

/// A single file being moved
#[derive(Debug, Clone)]
pub struct Job {
    pub direction: Direction,
    pub src: PathBuf,
    pub dst: PathBuf,
    pub offset: u64,
    pub total: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub bytes_resumed: u64,
    pub files_transferred: usize,
    pub files_resumed: usize,
    pub directories_created: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            bytes_resumed: self.bytes_resumed + other.bytes_resumed,
            files_transferred: self.files_transferred + other.files_transferred,
            files_resumed: self.files_resumed + other.files_resumed,
            directories_created: self.directories_created + other.directories_created,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            bytes resumed: {}\n\
            files transferred: {}\n\
            files resumed: {}\n\
            directories created: {}",
            bytesize::ByteSize(self.bytes_transferred),
            bytesize::ByteSize(self.bytes_resumed),
            self.files_transferred,
            self.files_resumed,
            self.directories_created,
        )
    }
}

/// Everything a transfer needs: both file services, the command runner of the remote side
/// and the settings of this operation
pub struct Context<S, D> {
    pub src_fs: Arc<S>,
    pub dst_fs: Arc<D>,
    pub runner: Arc<dyn CommandRunner>,
    pub direction: Direction,
    pub config: TransferConfig,
    pub prog_track: &'static progress::Progress,
    pub bars: Option<indicatif::MultiProgress>,
}

impl<S, D> Clone for Context<S, D> {
    fn clone(&self) -> Self {
        Self {
            src_fs: self.src_fs.clone(),
            dst_fs: self.dst_fs.clone(),
            runner: self.runner.clone(),
            direction: self.direction,
            config: self.config,
            prog_track: self.prog_track,
            bars: self.bars.clone(),
        }
    }
}

impl<S: FileService, D: FileService> Context<S, D> {
    /// Per-file progress bars are drawn (as a multi-bar display) when `config.progress` is set
    pub fn new(
        src_fs: Arc<S>,
        dst_fs: Arc<D>,
        runner: Arc<dyn CommandRunner>,
        direction: Direction,
        config: TransferConfig,
        prog_track: &'static progress::Progress,
    ) -> Self {
        Self {
            src_fs,
            dst_fs,
            runner,
            direction,
            config,
            prog_track,
            bars: config.progress.then(indicatif::MultiProgress::new),
        }
    }
}

fn has_trailing_slash(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().ends_with('/')
}

async fn stat<F: FileService>(fs: &Arc<F>, path: &Path) -> anyhow::Result<Option<FileStat>> {
    let fs = fs.clone();
    let path = path.to_path_buf();
    blocking(move || fs.stat(&path)).await
}

async fn mkdir_all<F: FileService>(fs: &Arc<F>, path: &Path) -> anyhow::Result<()> {
    let fs = fs.clone();
    let path = path.to_path_buf();
    blocking(move || fs.mkdir_all(&path)).await
}

/// Final path of a single file: a destination that is a directory, or ends with '/',
/// receives the file under its own name
async fn resolve_file_destination<S: FileService, D: FileService>(
    ctx: &Context<S, D>,
    src: &Path,
    dst: &Path,
) -> anyhow::Result<PathBuf> {
    let is_dir = stat(&ctx.dst_fs, dst).await?.is_some_and(|stat| stat.is_dir);
    if !is_dir && !has_trailing_slash(dst) {
        return Ok(dst.to_path_buf());
    }
    if !is_dir {
        mkdir_all(&ctx.dst_fs, dst).await?;
    }
    let name = src
        .file_name()
        .with_context(|| format!("source {src:?} has no file name"))?;
    Ok(dst.join(name))
}

/// Moves `src` to `dst`, as a single file or as a whole tree
#[instrument(skip(ctx))]
pub async fn transfer<S: FileService, D: FileService>(
    ctx: &Context<S, D>,
    src: &Path,
    dst: &Path,
) -> Result<Summary, Error> {
    ctx.config
        .validate()
        .map_err(|err| Error::new(anyhow!(err), Default::default()))?;
    let src_stat = stat(&ctx.src_fs, src)
        .await
        .map_err(|err| Error::new(err, Default::default()))?
        .ok_or_else(|| Error::new(anyhow!("source {src:?} does not exist"), Default::default()))?;
    if src_stat.is_dir {
        return transfer_dir(ctx, src, dst).await;
    }
    let dst = resolve_file_destination(ctx, src, dst)
        .await
        .map_err(|err| Error::new(err, Default::default()))?;
    transfer_file(ctx, src, &dst).await
}

#[instrument(skip(ctx))]
pub async fn transfer_file<S: FileService, D: FileService>(
    ctx: &Context<S, D>,
    src: &Path,
    dst: &Path,
) -> Result<Summary, Error> {
    let _guard = ctx.prog_track.files.guard();
    let src_stat = stat(&ctx.src_fs, src)
        .await
        .map_err(|err| Error::new(err, Default::default()))?
        .ok_or_else(|| Error::new(anyhow!("source {src:?} does not exist"), Default::default()))?;
    if src_stat.is_dir {
        return Err(Error::new(
            anyhow!("{src:?} is a directory, expected a regular file"),
            Default::default(),
        ));
    }
    let plan = {
        let dst_fs = ctx.dst_fs.clone();
        let dst = dst.to_path_buf();
        let total = src_stat.size;
        blocking(move || resume::plan(&*dst_fs, &dst, total))
            .await
            .map_err(|err| Error::new(err, Default::default()))?
    };
    let job = Job {
        direction: ctx.direction,
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        offset: plan.offset,
        total: plan.total,
    };
    tracing::debug!("starting {job:?}");
    let mut summary = Summary {
        bytes_resumed: job.offset,
        files_resumed: usize::from(plan.is_resume()),
        ..Default::default()
    };
    let reader = {
        let src_fs = ctx.src_fs.clone();
        let src = job.src.clone();
        let offset = job.offset;
        blocking(move || src_fs.open_read(&src, offset))
            .await
            .map_err(|err| Error::new(err, summary))?
    };
    let writer = {
        let dst_fs = ctx.dst_fs.clone();
        let staging = plan.staging.clone();
        let truncate = plan.truncate();
        blocking(move || dst_fs.open_write(&staging, truncate))
            .await
            .map_err(|err| Error::new(err, summary))?
    };
    let name = src
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bar = progress::file_bar(
        ctx.bars.as_ref(),
        ctx.config.progress,
        &name,
        job.total,
        job.offset,
    );
    let on_progress = {
        let bar = bar.clone();
        let prog_track = ctx.prog_track;
        move |bytes: u64| {
            bar.inc(bytes);
            prog_track.bytes_transferred.add(bytes);
        }
    };
    let copied = chunker::copy(
        &ctx.config,
        reader,
        Arc::new(writer),
        job.offset,
        on_progress,
    )
    .await
    .with_context(|| format!("failed copying {:?} to {:?}", &job.src, &plan.staging));
    bar.finish_and_clear();
    summary.bytes_transferred = copied.map_err(|err| Error::new(err, summary))?;
    {
        let dst_fs = ctx.dst_fs.clone();
        let plan = plan.clone();
        let dst = job.dst.clone();
        blocking(move || resume::commit(&*dst_fs, &plan, &dst))
            .await
            .map_err(|err| Error::new(err, summary))?;
    }
    if ctx.config.verify {
        tracing::info!("verifying integrity of {:?}", &job.dst);
        let runner = ctx.runner.clone();
        let (local, remote) = job.direction.sides(&job.src, &job.dst);
        let (local, remote) = (local.to_path_buf(), remote.to_path_buf());
        blocking(move || integrity::verify(runner.as_ref(), &local, &remote))
            .await
            .context("integrity check failed")
            .map_err(|err| Error::new(err, summary))?;
    }
    summary.files_transferred = 1;
    ctx.prog_track.files_transferred.inc();
    ctx.prog_track.bytes_resumed.add(job.offset);
    if plan.is_resume() {
        ctx.prog_track.files_resumed.inc();
    }
    tracing::info!("{} of {:?} complete", job.direction, &job.src);
    Ok(summary)
}

/// Mirrors the tree under `src` into `dst`.
///
/// Directories are created as the walk reaches them; files are handed to [`transfer_file`] with
/// at most `file_concurrency` running at once. After the first failure nothing new is started,
/// files already running are left to finish. The first recorded failure (of a file or of the
/// walk itself) is the result.
#[instrument(skip(ctx))]
pub async fn transfer_dir<S: FileService, D: FileService>(
    ctx: &Context<S, D>,
    src: &Path,
    dst: &Path,
) -> Result<Summary, Error> {
    if ctx.config.file_concurrency == 0 {
        return Err(Error::new(
            anyhow!("concurrency must be greater than 0"),
            Default::default(),
        ));
    }
    let mut summary = Summary::default();
    mkdir_all(&ctx.dst_fs, dst)
        .await
        .map_err(|err| Error::new(err, summary))?;
    summary.directories_created += 1;
    ctx.prog_track.directories_created.inc();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(ctx.config.file_concurrency));
    let failure = Arc::new(FirstError::new());
    let mut walker = ctx.src_fs.clone().walk(src);
    let mut join_set = tokio::task::JoinSet::new();
    loop {
        while let Some(res) = join_set.try_join_next() {
            match res {
                Ok(file_summary) => summary = summary + file_summary,
                Err(error) => {
                    failure.set(anyhow!(error).context("file transfer task panicked"));
                }
            }
        }
        if failure.is_set() {
            tracing::debug!("not starting new transfers after a failure");
            break;
        }
        let next = blocking(move || {
            let next = walker.next();
            Ok((walker, next))
        })
        .await;
        let entry = match next {
            Ok((returned, next)) => {
                walker = returned;
                match next {
                    Some(Ok(entry)) => entry,
                    Some(Err(error)) => {
                        failure.set(error.context(format!("failed traversing {src:?}")));
                        break;
                    }
                    None => break,
                }
            }
            Err(error) => {
                failure.set(error);
                break;
            }
        };
        let entry_src = src.join(&entry.relative);
        let entry_dst = dst.join(&entry.relative);
        if entry.stat.is_dir {
            if let Err(error) = mkdir_all(&ctx.dst_fs, &entry_dst).await {
                failure.set(error);
                break;
            }
            summary.directories_created += 1;
            ctx.prog_track.directories_created.inc();
            continue;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(error) => {
                failure.set(anyhow!(error));
                break;
            }
        };
        // a transfer may have failed while we waited for the permit
        if failure.is_set() {
            break;
        }
        let ctx = ctx.clone();
        let failure = failure.clone();
        join_set.spawn(async move {
            let _permit = permit;
            match transfer_file(&ctx, &entry_src, &entry_dst).await {
                Ok(file_summary) => file_summary,
                Err(error) => {
                    tracing::error!("{:?} -> {:?} failed: {:#}", &entry_src, &entry_dst, &error);
                    failure.set(error.source);
                    error.summary
                }
            }
        });
    }
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(file_summary) => summary = summary + file_summary,
            Err(error) => {
                failure.set(anyhow!(error).context("file transfer task panicked"));
            }
        }
    }
    match failure.take() {
        Some(error) => Err(Error::new(
            error.context(format!("failed transferring directory {src:?}")),
            summary,
        )),
        None => Ok(summary),
    }
}
