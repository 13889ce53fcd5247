//! Chunked copy of a single file.
//!
//! One producer reads the source sequentially in `buffer_size` blocks and queues every block
//! together with its absolute destination offset. A fixed pool of workers drains the queue and
//! writes each block at its own offset, so the order in which workers finish does not matter.
//! The queue holds at most `workers` chunks; a full queue blocks the producer.
//!
//! The first failure (from the producer or any worker) is kept in a [`FirstError`] slot and
//! becomes the result of the copy. Later failures are dropped. The producer checks the slot
//! before every read and also waits on it while blocked on a full queue.

use anyhow::{Context, anyhow};
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::instrument;

use crate::config::TransferConfig;
use crate::fs::{WriteAt, blocking};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    pub offset: u64,
}

/// Single-capacity error slot: the first error wins, every later one is dropped
#[derive(Debug, Default)]
pub struct FirstError {
    slot: Mutex<Option<anyhow::Error>>,
    token: tokio_util::sync::CancellationToken,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` unless another error was recorded already. Returns true if it was kept.
    pub fn set(&self, error: anyhow::Error) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            tracing::debug!("dropping subsequent error: {:#}", &error);
            return false;
        }
        *slot = Some(error);
        self.token.cancel();
        true
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once an error has been recorded
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn take(&self) -> Option<anyhow::Error> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn read_chunk<R: std::io::Read>(
    reader: &mut R,
    buffer_size: usize,
    position: u64,
) -> anyhow::Result<Bytes> {
    let mut buffer = BytesMut::zeroed(buffer_size);
    let read = loop {
        match reader.read(&mut buffer) {
            Ok(read) => break read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed reading source at offset {position}"));
            }
        }
    };
    buffer.truncate(read);
    Ok(buffer.freeze())
}

/// Copies everything `reader` yields into `writer`, starting at destination `offset`.
///
/// `on_progress` is called by the workers with the size of every chunk written.
/// Returns the number of bytes copied.
#[instrument(skip(reader, writer, on_progress))]
pub async fn copy<R, W, P>(
    config: &TransferConfig,
    reader: R,
    writer: Arc<W>,
    offset: u64,
    on_progress: P,
) -> anyhow::Result<u64>
where
    R: std::io::Read + Send + 'static,
    W: WriteAt,
    P: Fn(u64) + Send + Sync + 'static,
{
    config.validate().map_err(|error| anyhow!(error))?;
    let first_error = Arc::new(FirstError::new());
    let on_progress = Arc::new(on_progress);
    let (tx, rx) = async_channel::bounded::<Chunk>(config.workers);
    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..config.workers {
        let rx = rx.clone();
        let writer = writer.clone();
        let first_error = first_error.clone();
        let on_progress = on_progress.clone();
        join_set.spawn(async move {
            while let Ok(chunk) = rx.recv().await {
                let len = chunk.data.len() as u64;
                let chunk_offset = chunk.offset;
                let writer = writer.clone();
                let written = blocking(move || {
                    writer
                        .write_all_at(&chunk.data, chunk.offset)
                        .with_context(|| format!("failed writing {len} bytes at offset {chunk_offset}"))
                })
                .await;
                match written {
                    Ok(()) => on_progress(len),
                    Err(error) => {
                        first_error.set(error);
                        return;
                    }
                }
            }
        });
    }
    drop(rx);
    let buffer_size = config.buffer_size;
    let mut reader = reader;
    let mut position = offset;
    loop {
        if first_error.is_set() {
            tracing::debug!("stopping reads at offset {position}, a worker failed");
            break;
        }
        let read = blocking(move || {
            let data = read_chunk(&mut reader, buffer_size, position)?;
            Ok((reader, data))
        })
        .await;
        let data = match read {
            Ok((returned, data)) => {
                reader = returned;
                data
            }
            Err(error) => {
                first_error.set(error);
                break;
            }
        };
        if data.is_empty() {
            break;
        }
        let chunk = Chunk {
            offset: position,
            data,
        };
        position += chunk.data.len() as u64;
        tokio::select! {
            biased;
            _ = first_error.cancelled() => break,
            sent = tx.send(chunk) => {
                if sent.is_err() {
                    first_error.set(anyhow!("all chunk writers exited"));
                    break;
                }
            }
        }
    }
    drop(tx);
    while let Some(res) = join_set.join_next().await {
        if let Err(error) = res {
            first_error.set(anyhow!(error).context("chunk writer panicked"));
        }
    }
    match first_error.take() {
        Some(error) => Err(error),
        None => Ok(position - offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing_test::traced_test;

    /// In-memory destination, optionally stalling some writes to shuffle completion order
    #[derive(Default)]
    struct MemWriter {
        data: Mutex<Vec<u8>>,
        stall: bool,
    }

    impl WriteAt for MemWriter {
        fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
            if self.stall && offset % 3 == 0 {
                std::thread::sleep(std::time::Duration::from_micros(200));
            }
            let mut data = self.data.lock().unwrap();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }
    }

    struct FailingWriter;

    impl WriteAt for FailingWriter {
        fn write_all_at(&self, _buf: &[u8], _offset: u64) -> std::io::Result<()> {
            Err(std::io::Error::other("disk on fire"))
        }
    }

    /// Reader that counts how much of the source was consumed
    struct CountingReader {
        inner: std::io::Cursor<Vec<u8>>,
        consumed: Arc<AtomicU64>,
    }

    impl std::io::Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let read = self.inner.read(buf)?;
            self.consumed.fetch_add(read as u64, Ordering::SeqCst);
            Ok(read)
        }
    }

    fn config(workers: usize, buffer_size: usize) -> TransferConfig {
        TransferConfig {
            workers,
            buffer_size,
            ..Default::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_source_copies_nothing() -> anyhow::Result<()> {
        let writer = Arc::new(MemWriter::default());
        let progress = Arc::new(AtomicU64::new(0));
        let counter = progress.clone();
        let copied = copy(
            &config(4, 1024),
            std::io::Cursor::new(Vec::new()),
            writer.clone(),
            0,
            move |n| {
                counter.fetch_add(n, Ordering::SeqCst);
            },
        )
        .await?;
        assert_eq!(copied, 0);
        assert_eq!(progress.load(Ordering::SeqCst), 0);
        assert!(writer.data.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_from_offset_fills_tail() -> anyhow::Result<()> {
        let source = pattern(10_000);
        let writer = Arc::new(MemWriter::default());
        writer.data.lock().unwrap().extend_from_slice(&source[..4_000]);
        let copied = copy(
            &config(3, 512),
            std::io::Cursor::new(source[4_000..].to_vec()),
            writer.clone(),
            4_000,
            |_| {},
        )
        .await?;
        assert_eq!(copied, 6_000);
        assert_eq!(*writer.data.lock().unwrap(), source);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn worker_failure_stops_producer() {
        let source = pattern(4 * 1024 * 1024);
        let total = source.len() as u64;
        let consumed = Arc::new(AtomicU64::new(0));
        let reader = CountingReader {
            inner: std::io::Cursor::new(source),
            consumed: consumed.clone(),
        };
        let error = copy(
            &config(2, 32 * 1024),
            reader,
            Arc::new(FailingWriter),
            0,
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(format!("{error:#}").contains("disk on fire"));
        assert!(consumed.load(Ordering::SeqCst) < total);
    }

    /// Writer that parks every write until opened
    #[derive(Default)]
    struct GatedWriter {
        inner: MemWriter,
        open: Mutex<bool>,
        opened: std::sync::Condvar,
    }

    impl GatedWriter {
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl WriteAt for GatedWriter {
        fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            drop(open);
            self.inner.write_all_at(buf, offset)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn full_queue_blocks_producer() -> anyhow::Result<()> {
        let workers = 2;
        let buffer_size = 1024;
        // one chunk held by every parked writer, a full queue and one read waiting to be queued
        let limit = ((2 * workers + 1) * buffer_size) as u64;
        let source = pattern(1024 * 1024);
        let consumed = Arc::new(AtomicU64::new(0));
        let reader = CountingReader {
            inner: std::io::Cursor::new(source.clone()),
            consumed: consumed.clone(),
        };
        let writer = Arc::new(GatedWriter::default());
        let copying = {
            let writer = writer.clone();
            tokio::spawn(async move {
                copy(&config(workers, buffer_size), reader, writer, 0, |_| {}).await
            })
        };
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while consumed.load(Ordering::SeqCst) < limit {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await?;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(consumed.load(Ordering::SeqCst), limit);
        writer.release();
        let copied = copying.await??;
        assert_eq!(copied, source.len() as u64);
        assert_eq!(*writer.inner.data.lock().unwrap(), source);
        Ok(())
    }

    #[test]
    fn first_error_keeps_only_first() {
        let slot = FirstError::new();
        assert!(!slot.is_set());
        assert!(slot.set(anyhow!("first")));
        assert!(!slot.set(anyhow!("second")));
        assert!(slot.is_set());
        assert_eq!(slot.take().unwrap().to_string(), "first");
        assert!(slot.take().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn positional_writes_reassemble_source(
            len in 0usize..40_000,
            buffer_size in 16usize..4096,
            workers in 1usize..9,
            offset in 0u64..2048,
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            let source = pattern(len);
            let writer = Arc::new(MemWriter { stall: true, ..Default::default() });
            let progress = Arc::new(AtomicU64::new(0));
            let counter = progress.clone();
            let copied = runtime.block_on(copy(
                &config(workers, buffer_size),
                std::io::Cursor::new(source.clone()),
                writer.clone(),
                offset,
                move |n| { counter.fetch_add(n, Ordering::SeqCst); },
            )).unwrap();
            prop_assert_eq!(copied, len as u64);
            prop_assert_eq!(progress.load(Ordering::SeqCst), len as u64);
            let data = writer.data.lock().unwrap();
            if len > 0 {
                prop_assert_eq!(&data[offset as usize..], &source[..]);
            } else {
                prop_assert!(data.is_empty());
            }
        }
    }
}
