//! Remote filesystem over SFTP.

use anyhow::{Context, anyhow};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use common::fs::{DirEntry, FileService, FileStat, WriteAt};

use crate::session::{io_error, is_not_found, ssh_error};

const FILE_MODE: i32 = 0o644;
const DIR_MODE: i32 = 0o755;

pub struct SftpFs {
    sftp: ssh2::Sftp,
}

impl SftpFs {
    pub fn new(sftp: ssh2::Sftp) -> Self {
        Self { sftp }
    }
}

fn remote_stat(path: &Path, stat: &ssh2::FileStat) -> anyhow::Result<FileStat> {
    let is_dir = stat.is_dir();
    let size = match stat.size {
        Some(size) => size,
        None if is_dir => 0,
        None => return Err(anyhow!("server did not report the size of remote {path:?}")),
    };
    Ok(FileStat { size, is_dir })
}

/// Remote file read sequentially by the chunk producer
pub struct SftpReader<R = ssh2::File> {
    file: R,
}

impl<R: Read> Read for SftpReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf).map_err(io_error)
    }
}

/// Remote file shared by the chunk writers, each write seeks to its own offset first
pub struct SftpWriter<W = ssh2::File> {
    file: Mutex<W>,
}

impl<W: Write + Seek + Send + 'static> WriteAt for SftpWriter<W> {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        file.write_all(buf).map_err(io_error)
    }
}

impl FileService for SftpFs {
    type Reader = SftpReader;
    type Writer = SftpWriter;

    fn open_read(&self, path: &Path, offset: u64) -> anyhow::Result<Self::Reader> {
        let mut file = self
            .sftp
            .open(path)
            .map_err(ssh_error)
            .with_context(|| format!("cannot open remote {path:?} for reading"))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(io_error)
                .with_context(|| format!("cannot seek remote {path:?} to {offset}"))?;
        }
        Ok(SftpReader { file })
    }

    fn open_write(&self, path: &Path, truncate: bool) -> anyhow::Result<Self::Writer> {
        let mut flags = ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE;
        if truncate {
            flags |= ssh2::OpenFlags::TRUNCATE;
        }
        let file = self
            .sftp
            .open_mode(path, flags, FILE_MODE, ssh2::OpenType::File)
            .map_err(ssh_error)
            .with_context(|| format!("cannot open remote {path:?} for writing"))?;
        Ok(SftpWriter {
            file: Mutex::new(file),
        })
    }

    fn stat(&self, path: &Path) -> anyhow::Result<Option<FileStat>> {
        match self.sftp.stat(path) {
            Ok(stat) => remote_stat(path, &stat).map(Some),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(ssh_error(error))
                .with_context(|| format!("failed reading metadata from remote {path:?}")),
        }
    }

    fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<DirEntry>> {
        let listing = self
            .sftp
            .readdir(path)
            .map_err(ssh_error)
            .with_context(|| format!("cannot list remote directory {path:?}"))?;
        listing
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_os_string();
                (name != "." && name != "..").then(|| -> anyhow::Result<DirEntry> {
                    Ok(DirEntry {
                        name,
                        stat: remote_stat(&entry_path, &stat)?,
                    })
                })
            })
            .collect()
    }

    fn mkdir_all(&self, path: &Path) -> anyhow::Result<()> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if !matches!(component, Component::Normal(_) | Component::ParentDir) {
                continue;
            }
            match self.stat(&current)? {
                Some(stat) if stat.is_dir => continue,
                Some(_) => return Err(anyhow!("remote {current:?} exists and is not a directory")),
                None => {}
            }
            if let Err(error) = self.sftp.mkdir(&current, DIR_MODE) {
                // someone else may have created it in the meantime
                if !self.stat(&current)?.is_some_and(|stat| stat.is_dir) {
                    return Err(ssh_error(error))
                        .with_context(|| format!("cannot create remote directory {current:?}"));
                }
            }
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        self.sftp
            .rename(from, to, None)
            .map_err(ssh_error)
            .with_context(|| format!("failed renaming remote {from:?} to {to:?}"))
    }

    fn remove(&self, path: &Path) -> anyhow::Result<()> {
        self.sftp
            .unlink(path)
            .map_err(ssh_error)
            .with_context(|| format!("failed removing remote {path:?}"))
    }
}
