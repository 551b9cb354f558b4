//! Spillover buffer.
//!
//! A [`Spool`] is an append-only byte queue with one writer and any number
//! of readers. Bytes are kept in memory until the total written crosses
//! [`SpoolConfig::threshold`]; at that point the memory contents are copied
//! into a fresh temporary file and every later write goes to the file.
//!
//! Readers keep their own cursor and always start at offset zero. A reader
//! that catches up with the writer waits until more bytes arrive, the
//! writer finishes, or the spool fails. The memory-to-disk switch happens
//! under the state lock only after the file holds every byte written so
//! far, so a reader never observes a gap or a duplicate.
//!
//! The backing file is deleted when the spool is closed or when the last
//! handle is dropped.

use crate::{SpoolError, SpoolResult};
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

/// Default memory ceiling before spilling to disk (1 MiB).
pub const DEFAULT_THRESHOLD: usize = 1024 * 1024;

/// Spool settings.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Bytes kept in memory before switching to a backing file.
    pub threshold: usize,
    /// Directory for backing files. Uses the system temp dir when unset.
    pub dir: Option<PathBuf>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            dir: None,
        }
    }
}

impl SpoolConfig {
    /// Creates a config with the given threshold and the system temp dir.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            dir: None,
        }
    }
}

#[derive(Default)]
struct State {
    memory: Vec<u8>,
    backing: Option<TempPath>,
    total_written: u64,
    finished: bool,
    writer_gone: bool,
    closed: bool,
    failure: Option<(io::ErrorKind, String)>,
}

struct Shared {
    config: SpoolConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn wake(&self) {
        self.notify.notify_waiters();
    }

    fn fail(&self, err: &io::Error) {
        self.state.lock().failure = Some((err.kind(), err.to_string()));
        self.wake();
    }

    fn close(&self) {
        let backing = {
            let mut state = self.state.lock();
            state.closed = true;
            state.memory = Vec::new();
            state.backing.take()
        };
        if let Some(path) = backing {
            if let Err(e) = path.close() {
                tracing::warn!(error = %e, "Failed to remove spool backing file");
            }
        }
        self.wake();
    }
}

/// Constructor for spool handle pairs.
pub struct Spool;

impl Spool {
    /// Creates a spool and returns its writer and a reader positioned at
    /// the first byte.
    pub fn channel(config: SpoolConfig) -> (SpoolWriter, SpoolReader) {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        });
        let writer = SpoolWriter {
            shared: shared.clone(),
            file: None,
            finished: false,
        };
        let reader = SpoolReader::new(shared);
        (writer, reader)
    }
}

/// Write half of a spool.
pub struct SpoolWriter {
    shared: Arc<Shared>,
    file: Option<File>,
    finished: bool,
}

impl SpoolWriter {
    /// Appends `data` to the spool.
    ///
    /// A failure is also recorded in the spool so that readers waiting for
    /// more data see it.
    pub async fn write(&mut self, data: &[u8]) -> SpoolResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self.append(data).await {
            Err(SpoolError::Io(e)) => {
                self.shared.fail(&e);
                Err(SpoolError::Io(e))
            }
            other => other,
        }
    }

    async fn append(&mut self, data: &[u8]) -> SpoolResult<()> {
        let total = {
            let state = self.shared.state.lock();
            if state.closed {
                return Err(SpoolError::Closed);
            }
            state.total_written
        };

        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
            file.flush().await?;
            self.commit(data.len());
            return Ok(());
        }

        if total + data.len() as u64 <= self.shared.config.threshold as u64 {
            {
                let mut state = self.shared.state.lock();
                state.memory.extend_from_slice(data);
                state.total_written += data.len() as u64;
            }
            self.shared.wake();
            return Ok(());
        }

        self.spill(data).await
    }

    /// Moves the in-memory bytes plus `data` into a new backing file.
    async fn spill(&mut self, data: &[u8]) -> SpoolResult<()> {
        let named = match &self.shared.config.dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        let (std_file, path) = named.into_parts();
        let mut file = File::from_std(std_file);

        let memory = self.shared.state.lock().memory.clone();
        file.write_all(&memory).await?;
        file.write_all(data).await?;
        file.flush().await?;

        tracing::debug!(
            path = %path.display(),
            bytes = memory.len() + data.len(),
            "Spool spilled to disk"
        );

        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SpoolError::Closed);
            }
            state.backing = Some(path);
            state.memory = Vec::new();
            state.total_written += data.len() as u64;
        }
        self.file = Some(file);
        self.shared.wake();
        Ok(())
    }

    fn commit(&self, len: usize) {
        self.shared.state.lock().total_written += len as u64;
        self.shared.wake();
    }

    /// Marks the end of the data. Readers that reach the end get `Ok(0)`.
    pub fn finish(mut self) {
        self.finished = true;
        self.shared.state.lock().finished = true;
        self.shared.wake();
    }

    /// Returns a new reader positioned at the first byte.
    pub fn reader(&self) -> SpoolReader {
        SpoolReader::new(self.shared.clone())
    }

    /// Total bytes written so far.
    pub fn len(&self) -> u64 {
        self.shared.state.lock().total_written
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the spool has moved to a backing file.
    pub fn is_spilled(&self) -> bool {
        self.shared.state.lock().backing.is_some()
    }

    /// Path of the backing file, if the spool has spilled.
    pub fn backing_path(&self) -> Option<PathBuf> {
        self.shared
            .state
            .lock()
            .backing
            .as_ref()
            .map(|p| p.to_path_buf())
    }

    /// Closes the spool and deletes its backing file. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.state.lock().writer_gone = true;
            self.shared.wake();
        }
    }
}

enum Next {
    Wait,
    Disk { path: PathBuf, available: u64 },
}

/// Read half of a spool. Each reader has an independent cursor.
pub struct SpoolReader {
    shared: Arc<Shared>,
    cursor: u64,
    file: Option<File>,
}

impl SpoolReader {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            cursor: 0,
            file: None,
        }
    }

    /// Reads the next bytes into `buf`, waiting for the writer if needed.
    ///
    /// Returns `Ok(0)` once every byte has been read and the writer has
    /// finished.
    pub async fn read(&mut self, buf: &mut [u8]) -> SpoolResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Owned handle so the pinned `Notified` does not borrow `self`.
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let state = shared.state.lock();
                if state.closed {
                    return Err(SpoolError::Closed);
                }
                if let Some((kind, message)) = &state.failure {
                    return Err(SpoolError::Io(io::Error::new(*kind, message.clone())));
                }
                if self.cursor < state.total_written {
                    match &state.backing {
                        None => {
                            let start = self.cursor as usize;
                            let n = buf.len().min(state.memory.len() - start);
                            buf[..n].copy_from_slice(&state.memory[start..start + n]);
                            self.cursor += n as u64;
                            return Ok(n);
                        }
                        Some(path) => Next::Disk {
                            path: path.to_path_buf(),
                            available: state.total_written - self.cursor,
                        },
                    }
                } else if state.finished {
                    return Ok(0);
                } else if state.writer_gone {
                    return Err(SpoolError::WriterAborted);
                } else {
                    Next::Wait
                }
            };

            match next {
                Next::Wait => notified.await,
                Next::Disk { path, available } => {
                    return self.read_disk(&path, buf, available).await;
                }
            }
        }
    }

    async fn read_disk(&mut self, path: &Path, buf: &mut [u8], available: u64) -> SpoolResult<usize> {
        if self.file.is_none() {
            let mut file = File::open(path).await?;
            file.seek(SeekFrom::Start(self.cursor)).await?;
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(SpoolError::Closed);
        };

        let want = buf.len().min(available.min(usize::MAX as u64) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(SpoolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "spool backing file shorter than written length",
            )));
        }
        self.cursor += n as u64;
        Ok(n)
    }

    /// Reads everything until the writer finishes.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> SpoolResult<usize> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    /// Bytes consumed by this reader so far.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Closes the spool and deletes its backing file. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Turns the reader into a stream of chunks of at most `chunk_size`
    /// bytes, ending when the writer finishes.
    pub fn into_stream(self, chunk_size: usize) -> impl Stream<Item = SpoolResult<Bytes>> + Send {
        let buf = vec![0u8; chunk_size.max(1)];
        futures::stream::try_unfold((self, buf), |(mut reader, mut buf)| async move {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            Ok(Some((Bytes::copy_from_slice(&buf[..n]), (reader, buf))))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn write_in_chunks(writer: &mut SpoolWriter, data: &[u8], chunk: usize) {
        for piece in data.chunks(chunk) {
            writer.write(piece).await.unwrap();
        }
    }

    async fn roundtrip(len: usize) {
        let (mut writer, mut reader) = Spool::channel(SpoolConfig::with_threshold(1024));
        let data = pattern(len);

        write_in_chunks(&mut writer, &data, 333).await;
        assert_eq!(writer.is_spilled(), len > 1024);
        writer.finish();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), len);
        assert!(out == data);
    }

    #[tokio::test]
    async fn below_threshold_stays_in_memory() {
        roundtrip(100).await;
    }

    #[tokio::test]
    async fn exactly_threshold_stays_in_memory() {
        roundtrip(1024).await;
    }

    #[tokio::test]
    async fn one_past_threshold_spills() {
        roundtrip(1025).await;
    }

    #[tokio::test]
    async fn far_above_threshold_spills() {
        roundtrip(10_000_000).await;
    }

    #[tokio::test]
    async fn reader_runs_concurrently_with_writer() {
        let (mut writer, reader) = Spool::channel(SpoolConfig::with_threshold(4096));
        let data = pattern(2_000_000);
        let expected = data.clone();

        let consumer = tokio::spawn(async move {
            let mut reader = reader;
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            out
        });

        for piece in data.chunks(7919) {
            writer.write(piece).await.unwrap();
            tokio::task::yield_now().await;
        }
        writer.finish();

        let out = consumer.await.unwrap();
        assert!(out == expected);
    }

    #[tokio::test]
    async fn every_reader_starts_at_the_beginning() {
        let (mut writer, mut first) = Spool::channel(SpoolConfig::with_threshold(16));
        writer.write(b"0123456789").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(first.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");

        writer.write(b"abcdefghij").await.unwrap();
        let mut second = writer.reader();
        writer.finish();

        let mut out = Vec::new();
        second.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789abcdefghij");

        let mut rest = Vec::new();
        first.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"456789abcdefghij");
    }

    #[tokio::test]
    async fn waiting_reader_follows_spill_to_disk() {
        let (mut writer, mut reader) = Spool::channel(SpoolConfig::with_threshold(8));
        let waiting = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let n = reader.read(&mut buf).await.unwrap();
            (buf[..n].to_vec(), reader)
        });
        tokio::task::yield_now().await;

        writer.write(b"well past eight bytes").await.unwrap();
        assert!(writer.is_spilled());
        let (first, mut reader) = waiting.await.unwrap();
        assert_eq!(first, b"well past eight bytes");

        writer.write(b", then more").await.unwrap();
        writer.finish();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b", then more");
    }

    #[tokio::test]
    async fn dropped_writer_is_reported_to_reader() {
        let (mut writer, mut reader) = Spool::channel(SpoolConfig::default());
        writer.write(b"partial").await.unwrap();
        drop(writer);

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(err, SpoolError::WriterAborted));
        assert_eq!(out, b"partial");
    }

    #[tokio::test]
    async fn backing_failure_reaches_writer_and_reader() {
        let config = SpoolConfig {
            threshold: 8,
            dir: Some(PathBuf::from("/nonexistent/ges-spool-dir")),
        };
        let (mut writer, mut reader) = Spool::channel(config);
        writer.write(b"1234").await.unwrap();

        let waiting = tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await
        });
        tokio::task::yield_now().await;

        let err = writer.write(b"56789").await.unwrap_err();
        assert!(matches!(err, SpoolError::Io(_)));

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(SpoolError::Io(_))));
    }

    #[tokio::test]
    async fn close_removes_backing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SpoolConfig {
            threshold: 4,
            dir: Some(dir.path().to_path_buf()),
        };
        let (mut writer, reader) = Spool::channel(config);
        writer.write(b"more than four bytes").await.unwrap();

        let path = writer.backing_path().unwrap();
        assert!(path.exists());

        reader.close();
        assert!(!path.exists());
        reader.close();
        writer.close();

        assert!(matches!(writer.write(b"x").await, Err(SpoolError::Closed)));
    }

    #[tokio::test]
    async fn dropping_all_handles_removes_backing_file() {
        let (mut writer, reader) = Spool::channel(SpoolConfig::with_threshold(2));
        writer.write(b"spill").await.unwrap();
        let path = writer.backing_path().unwrap();

        drop(reader);
        drop(writer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stream_yields_all_chunks() {
        use futures::TryStreamExt;

        let (mut writer, reader) = Spool::channel(SpoolConfig::with_threshold(10));
        let data = pattern(100);
        write_in_chunks(&mut writer, &data, 9).await;
        writer.finish();

        let chunks: Vec<Bytes> = reader.into_stream(16).try_collect().await.unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 16));
        assert_eq!(chunks.concat(), data);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_reads_match_writes(
            threshold in 1usize..4096,
            pieces in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..700), 0..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let out = rt.block_on(async {
                let (mut writer, mut reader) = Spool::channel(SpoolConfig::with_threshold(threshold));
                for piece in &pieces {
                    writer.write(piece).await.unwrap();
                }
                writer.finish();
                let mut out = Vec::new();
                reader.read_to_end(&mut out).await.unwrap();
                out
            });
            prop_assert_eq!(out, pieces.concat());
        }
    }
}
