//! File access used by the transfer engine.
//!
//! Both ends of a transfer are a [`FileService`]: the local filesystem ([`LocalFs`]) or a remote
//! endpoint. All methods are blocking, callers run them on the blocking pool via [`blocking`].

use anyhow::Context;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: std::ffi::OsString,
    pub stat: FileStat,
}

/// Entry produced while walking a tree, relative to the walk root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub relative: PathBuf,
    pub stat: FileStat,
}

pub type Walk = Box<dyn Iterator<Item = anyhow::Result<WalkEntry>> + Send>;

/// Destination handle accepting offset-addressed writes from several threads at once
pub trait WriteAt: Send + Sync + 'static {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()>;
}

impl WriteAt for std::fs::File {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        FileExt::write_all_at(self, buf, offset)
    }
}

pub trait FileService: Send + Sync + 'static {
    type Reader: std::io::Read + Send + 'static;
    type Writer: WriteAt;

    /// Open `path` for sequential reading starting at `offset`
    fn open_read(&self, path: &Path, offset: u64) -> anyhow::Result<Self::Reader>;

    /// Open (creating if needed) `path` for positional writes, truncating it when `truncate` is set
    fn open_write(&self, path: &Path, truncate: bool) -> anyhow::Result<Self::Writer>;

    /// Returns `None` when nothing exists at `path`
    fn stat(&self, path: &Path) -> anyhow::Result<Option<FileStat>>;

    fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<DirEntry>>;

    fn mkdir_all(&self, path: &Path) -> anyhow::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()>;

    fn remove(&self, path: &Path) -> anyhow::Result<()>;

    /// Pre-order traversal of everything below `root`, siblings sorted by name
    fn walk(self: Arc<Self>, root: &Path) -> Walk
    where
        Self: Sized,
    {
        Box::new(TreeWalk::new(self, root))
    }
}

/// Runs a blocking file operation on tokio's blocking pool
pub async fn blocking<F, T>(func: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(func)
        .await
        .context("blocking file operation panicked")?
}

/// Generic tree walk built on [`FileService::read_dir`]
pub struct TreeWalk<S> {
    fs: Arc<S>,
    root: PathBuf,
    // pending entries, next one on top
    stack: Vec<WalkEntry>,
    // directory yielded last, listed on the next call
    deferred: Option<PathBuf>,
    started: bool,
}

impl<S: FileService> TreeWalk<S> {
    pub fn new(fs: Arc<S>, root: &Path) -> Self {
        Self {
            fs,
            root: root.to_path_buf(),
            stack: Vec::new(),
            deferred: None,
            started: false,
        }
    }

    fn expand(&mut self, relative: &Path) -> anyhow::Result<()> {
        let mut entries = self.fs.read_dir(&self.root.join(relative))?;
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        self.stack
            .extend(entries.into_iter().map(|entry| WalkEntry {
                relative: relative.join(&entry.name),
                stat: entry.stat,
            }));
        Ok(())
    }
}

impl<S: FileService> Iterator for TreeWalk<S> {
    type Item = anyhow::Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if let Err(error) = self.expand(Path::new("")) {
                return Some(Err(error));
            }
        }
        if let Some(dir) = self.deferred.take() {
            if let Err(error) = self.expand(&dir) {
                return Some(Err(error));
            }
        }
        let entry = self.stack.pop()?;
        if entry.stat.is_dir {
            self.deferred = Some(entry.relative.clone());
        }
        Some(Ok(entry))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn local_stat(metadata: &std::fs::Metadata) -> FileStat {
    FileStat {
        size: metadata.len(),
        is_dir: metadata.is_dir(),
    }
}

impl FileService for LocalFs {
    type Reader = std::fs::File;
    type Writer = std::fs::File;

    fn open_read(&self, path: &Path, offset: u64) -> anyhow::Result<Self::Reader> {
        use std::io::Seek;
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("cannot open {path:?} for reading"))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .with_context(|| format!("cannot seek {path:?} to {offset}"))?;
        }
        Ok(file)
    }

    fn open_write(&self, path: &Path, truncate: bool) -> anyhow::Result<Self::Writer> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .mode(0o644)
            .open(path)
            .with_context(|| format!("cannot open {path:?} for writing"))
    }

    fn stat(&self, path: &Path) -> anyhow::Result<Option<FileStat>> {
        match std::fs::metadata(path) {
            Ok(metadata) => Ok(Some(local_stat(&metadata))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed reading metadata from {path:?}"))
            }
        }
    }

    fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("cannot open directory {path:?} for reading"))?
        {
            let entry =
                entry.with_context(|| format!("failed traversing directory {path:?}"))?;
            let metadata = std::fs::metadata(entry.path())
                .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?;
            entries.push(DirEntry {
                name: entry.file_name(),
                stat: local_stat(&metadata),
            });
        }
        Ok(entries)
    }

    fn mkdir_all(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("cannot create directory {path:?}"))
    }

    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        std::fs::rename(from, to).with_context(|| format!("failed renaming {from:?} to {to:?}"))
    }

    fn remove(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::remove_file(path).with_context(|| format!("failed removing {path:?}"))
    }

    fn walk(self: Arc<Self>, root: &Path) -> Walk {
        let root = root.to_path_buf();
        let walker = walkdir::WalkDir::new(&root)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter();
        Box::new(walker.map(move |entry| {
            let entry = entry.with_context(|| format!("failed traversing {root:?}"))?;
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .with_context(|| format!("{:?} is outside of {root:?}", entry.path()))?
                .to_path_buf();
            Ok(WalkEntry {
                relative,
                stat: local_stat(&metadata),
            })
        }))
    }
}
