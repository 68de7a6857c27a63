//! Per-instance log pipes.
//!
//! Every instance gets a FIFO at `<workspace>/<name>/log_pipe`. The container
//! writes to its standard streams; a forwarder task copies the runtime's log
//! stream into the FIFO through a [`LogSink`], which never blocks: chunks
//! written while no reader is attached are dropped. Readers attach with
//! [`LogPipeManager::attach`] and only observe data written afterwards.
//!
//! A FIFO has one stream. Readers attached at the same time share it, so each
//! chunk reaches one of them; attaching next to a live reader leaves that
//! reader's unread output in place.

use futures::StreamExt;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::unix::pipe;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TestnetError};
use crate::runtime::LogStream;

/// File name of the pipe inside an instance workspace.
pub const LOG_PIPE_FILE: &str = "log_pipe";

/// How instance logs are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Logs are forwarded into a per-instance named pipe.
    NamedPipes,
    /// Logs stay with the runtime's log driver.
    RuntimeDefault,
    /// Logs are discarded.
    Discard,
}

impl LogMode {
    /// Returns true if pipes are created in this mode.
    pub fn uses_pipes(&self) -> bool {
        matches!(self, Self::NamedPipes)
    }

    /// Returns true if the runtime should keep no logs.
    pub fn discards(&self) -> bool {
        matches!(self, Self::Discard)
    }
}

/// Byte counters shared between a pipe handle and its sink.
#[derive(Debug, Default)]
pub struct PipeCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl PipeCounters {
    fn record(&self, outcome: WriteOutcome, len: usize) {
        let delivered = match outcome {
            WriteOutcome::Delivered => len,
            WriteOutcome::Partial { written } => written,
            WriteOutcome::NoReader | WriteOutcome::ReaderGone | WriteOutcome::Failed => 0,
        };
        self.delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add((len - delivered) as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of the counters.
    pub fn snapshot(&self) -> PipeStats {
        PipeStats {
            delivered_bytes: self.delivered.load(Ordering::Relaxed),
            dropped_bytes: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time pipe statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeStats {
    /// Bytes that reached a reader.
    pub delivered_bytes: u64,
    /// Bytes dropped because no reader could take them.
    pub dropped_bytes: u64,
}

/// Result of a single [`LogSink::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole chunk was written.
    Delivered,
    /// The reader fell behind; the remainder of the chunk was dropped.
    Partial {
        /// Bytes written before the pipe filled up.
        written: usize,
    },
    /// No reader is attached; the chunk was dropped.
    NoReader,
    /// The reader went away; the writer was closed and the chunk dropped.
    ReaderGone,
    /// The pipe could not be written; the chunk was dropped.
    Failed,
}

/// Non-blocking writer into a FIFO.
///
/// The write end is opened lazily and reopened after a reader disappears.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Option<File>,
    counters: Arc<PipeCounters>,
}

impl LogSink {
    /// Creates a sink writing to the pipe at `path`.
    pub fn new(path: impl Into<PathBuf>, counters: Arc<PipeCounters>) -> Self {
        Self {
            path: path.into(),
            file: None,
            counters,
        }
    }

    /// Writes a chunk without blocking.
    pub fn write(&mut self, chunk: &[u8]) -> WriteOutcome {
        let outcome = self.write_inner(chunk);
        self.counters.record(outcome, chunk.len());
        outcome
    }

    fn write_inner(&mut self, chunk: &[u8]) -> WriteOutcome {
        if chunk.is_empty() {
            return WriteOutcome::Delivered;
        }

        if self.file.is_none() {
            match open_writer(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                    return WriteOutcome::NoReader
                }
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "Cannot open log pipe for writing");
                    return WriteOutcome::Failed;
                }
            }
        }
        let Some(file) = self.file.as_mut() else {
            return WriteOutcome::Failed;
        };

        let mut written = 0;
        while written < chunk.len() {
            match file.write(&chunk[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    self.file = None;
                    return if written == 0 {
                        WriteOutcome::ReaderGone
                    } else {
                        WriteOutcome::Partial { written }
                    };
                }
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "Log pipe write failed");
                    self.file = None;
                    return WriteOutcome::Failed;
                }
            }
        }

        if written == chunk.len() {
            WriteOutcome::Delivered
        } else {
            WriteOutcome::Partial { written }
        }
    }
}

fn open_writer(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

/// Reader attached to a log pipe.
///
/// The pipe is opened read-write, so the reader never sees end-of-file when
/// the writer goes away; it simply waits for more data.
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    inner: pipe::Receiver,
    readers: Option<Arc<AtomicUsize>>,
}

impl LogReader {
    /// Opens the pipe at `path` and discards anything already buffered.
    ///
    /// Meant for a single consumer: a process that cannot see other readers
    /// of the pipe discards their unread output. Must be called from within a
    /// tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, drain: bool) -> Result<Self> {
        let inner = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)
            .map_err(|e| TestnetError::pipe_creation_failed(path, e.to_string()))?;

        if drain {
            drain_buffered(path, &inner)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner,
            readers: None,
        })
    }

    /// Path of the pipe this reader is attached to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        if let Some(readers) = &self.readers {
            readers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn drain_buffered(path: &Path, inner: &pipe::Receiver) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut discarded = 0usize;
    loop {
        match inner.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TestnetError::pipe_creation_failed(path, e.to_string())),
        }
    }
    if discarded > 0 {
        debug!(path = %path.display(), discarded, "Discarded buffered log data on attach");
    }
    Ok(())
}

impl AsyncRead for LogReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Handle to a created log pipe.
#[derive(Debug, Clone)]
pub struct LogPipeHandle {
    path: PathBuf,
    counters: Arc<PipeCounters>,
    readers: Arc<AtomicUsize>,
}

impl LogPipeHandle {
    /// Path of the FIFO.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current byte counters.
    pub fn stats(&self) -> PipeStats {
        self.counters.snapshot()
    }

    /// Number of readers attached through the manager.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Creates a sink writing into this pipe.
    pub fn sink(&self) -> LogSink {
        LogSink::new(self.path.clone(), Arc::clone(&self.counters))
    }
}

struct PipeEntry {
    handle: LogPipeHandle,
    forwarder: Option<JoinHandle<()>>,
}

/// Owns the log pipes of one testnet run.
pub struct LogPipeManager {
    mode: LogMode,
    pipes: Arc<RwLock<HashMap<PathBuf, PipeEntry>>>,
}

impl LogPipeManager {
    /// Creates a manager for the given log mode.
    pub fn new(mode: LogMode) -> Self {
        Self {
            mode,
            pipes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the log mode.
    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// Creates the pipe at `path`, replacing any stale file there.
    ///
    /// Returns `None` when pipes are disabled. The parent directory must
    /// already exist.
    pub async fn create(&self, path: &Path) -> Result<Option<LogPipeHandle>> {
        if !self.mode.uses_pipes() {
            return Ok(None);
        }

        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || make_fifo(&target))
            .await
            .map_err(|e| TestnetError::pipe_creation_failed(path, e.to_string()))??;

        let handle = LogPipeHandle {
            path: path.to_path_buf(),
            counters: Arc::new(PipeCounters::default()),
            readers: Arc::new(AtomicUsize::new(0)),
        };

        let previous = self.pipes.write().await.insert(
            path.to_path_buf(),
            PipeEntry {
                handle: handle.clone(),
                forwarder: None,
            },
        );
        if let Some(forwarder) = previous.and_then(|entry| entry.forwarder) {
            forwarder.abort();
        }

        debug!(path = %path.display(), "Created log pipe");
        Ok(Some(handle))
    }

    /// Spawns a task forwarding `stream` into the pipe.
    pub async fn forward(&self, handle: &LogPipeHandle, mut stream: LogStream) {
        let mut sink = handle.sink();
        let path = handle.path.clone();

        let task = tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        sink.write(&bytes);
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Log stream ended with error");
                        break;
                    }
                }
            }
            debug!(path = %path.display(), "Log forwarder finished");
        });

        let mut pipes = self.pipes.write().await;
        match pipes.get_mut(handle.path()) {
            Some(entry) => {
                if let Some(old) = entry.forwarder.replace(task) {
                    old.abort();
                }
            }
            None => {
                warn!(path = %handle.path.display(), "Forwarding into an unmanaged log pipe");
                pipes.insert(
                    handle.path.clone(),
                    PipeEntry {
                        handle: handle.clone(),
                        forwarder: Some(task),
                    },
                );
            }
        }
    }

    /// Attaches a new reader to the pipe.
    ///
    /// Output buffered before the first reader attaches is discarded. Output
    /// buffered while another reader is attached belongs to that reader and
    /// is left alone.
    pub fn attach(&self, handle: &LogPipeHandle) -> Result<LogReader> {
        let others = handle.readers.fetch_add(1, Ordering::AcqRel);
        let mut reader = match LogReader::open_with(handle.path(), others == 0) {
            Ok(reader) => reader,
            Err(e) => {
                handle.readers.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        reader.readers = Some(Arc::clone(&handle.readers));
        info!(path = %handle.path.display(), readers = others + 1, "Attached log reader");
        Ok(reader)
    }

    /// Detaches a reader.
    pub fn detach(&self, reader: LogReader) {
        info!(path = %reader.path.display(), "Detached log reader");
        drop(reader);
    }

    /// Returns the handle of a managed pipe.
    pub async fn handle(&self, path: &Path) -> Option<LogPipeHandle> {
        self.pipes
            .read()
            .await
            .get(path)
            .map(|entry| entry.handle.clone())
    }

    /// Stops forwarding into the pipe at `path` and forgets it.
    ///
    /// The FIFO itself is left on disk.
    pub async fn release(&self, path: &Path) {
        if let Some(entry) = self.pipes.write().await.remove(path) {
            if let Some(forwarder) = entry.forwarder {
                forwarder.abort();
            }
        }
    }

    /// Releases every pipe.
    pub async fn release_all(&self) {
        let mut pipes = self.pipes.write().await;
        for (_, entry) in pipes.drain() {
            if let Some(forwarder) = entry.forwarder {
                forwarder.abort();
            }
        }
    }

    /// Number of managed pipes.
    pub async fn len(&self) -> usize {
        self.pipes.read().await.len()
    }

    /// Returns true if no pipes are managed.
    pub async fn is_empty(&self) -> bool {
        self.pipes.read().await.is_empty()
    }
}

impl std::fmt::Debug for LogPipeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeManager")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => std::fs::remove_file(path)
            .map_err(|e| TestnetError::pipe_creation_failed(path, format!("removing stale pipe: {e}")))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(TestnetError::pipe_creation_failed(path, e.to_string())),
    }

    let mode = Mode::S_IRUSR
        | Mode::S_IWUSR
        | Mode::S_IRGRP
        | Mode::S_IWGRP
        | Mode::S_IROTH
        | Mode::S_IWOTH;
    nix::unistd::mkfifo(path, mode)
        .map_err(|e| TestnetError::pipe_creation_failed(path, e.desc()))?;

    Ok(())
}

/// Returns true if `path` is a FIFO.
pub fn is_fifo(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn read_some(reader: &mut LogReader) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_create_makes_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);

        let handle = manager.create(&path).await.unwrap().unwrap();
        assert!(is_fifo(handle.path()));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        std::fs::write(&path, b"stale").unwrap();

        let manager = LogPipeManager::new(LogMode::NamedPipes);
        manager.create(&path).await.unwrap();
        assert!(is_fifo(&path));

        manager.create(&path).await.unwrap();
        assert!(is_fifo(&path));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);

        let err = manager.create(&path).await.unwrap_err();
        assert!(matches!(err, TestnetError::PipeCreation { .. }));
    }

    #[tokio::test]
    async fn test_disabled_modes_create_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);

        for mode in [LogMode::RuntimeDefault, LogMode::Discard] {
            let manager = LogPipeManager::new(mode);
            assert!(manager.create(&path).await.unwrap().is_none());
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_sink_without_reader_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();

        let mut sink = handle.sink();
        for _ in 0..100 {
            assert_eq!(sink.write(b"nobody is listening\n"), WriteOutcome::NoReader);
        }
        let stats = handle.stats();
        assert_eq!(stats.delivered_bytes, 0);
        assert_eq!(stats.dropped_bytes, 2000);
    }

    #[tokio::test]
    async fn test_reader_receives_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();

        let mut reader = manager.attach(&handle).unwrap();
        let mut sink = handle.sink();
        assert_eq!(sink.write(b"hello\n"), WriteOutcome::Delivered);

        assert_eq!(read_some(&mut reader).await, b"hello\n");
        assert_eq!(handle.stats().delivered_bytes, 6);
        manager.detach(reader);
    }

    #[tokio::test]
    async fn test_attach_does_not_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();
        let mut sink = handle.sink();

        // A reader outside the manager leaves output buffered in the kernel.
        let stale = LogReader::open(&path).unwrap();
        assert_eq!(sink.write(b"before\n"), WriteOutcome::Delivered);

        let mut reader = manager.attach(&handle).unwrap();
        drop(stale);
        assert_eq!(sink.write(b"after\n"), WriteOutcome::Delivered);

        assert_eq!(read_some(&mut reader).await, b"after\n");
    }

    #[tokio::test]
    async fn test_second_reader_keeps_first_readers_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();
        let mut sink = handle.sink();

        let mut first = manager.attach(&handle).unwrap();
        assert_eq!(sink.write(b"unread\n"), WriteOutcome::Delivered);

        let second = manager.attach(&handle).unwrap();
        assert_eq!(handle.readers(), 2);
        assert_eq!(read_some(&mut first).await, b"unread\n");

        manager.detach(second);
        assert_eq!(handle.readers(), 1);
        manager.detach(first);
        assert_eq!(handle.readers(), 0);
    }

    #[tokio::test]
    async fn test_reader_gone_then_no_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();
        let mut sink = handle.sink();

        let reader = manager.attach(&handle).unwrap();
        assert_eq!(sink.write(b"x"), WriteOutcome::Delivered);
        manager.detach(reader);

        assert_eq!(sink.write(b"y"), WriteOutcome::ReaderGone);
        assert_eq!(sink.write(b"z"), WriteOutcome::NoReader);
    }

    #[tokio::test]
    async fn test_slow_reader_never_blocks_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();
        let mut sink = handle.sink();

        let _reader = manager.attach(&handle).unwrap();
        let chunk = vec![b'a'; 64 * 1024];
        let mut saw_drop = false;
        for _ in 0..64 {
            if sink.write(&chunk) != WriteOutcome::Delivered {
                saw_drop = true;
            }
        }
        assert!(saw_drop);
        assert!(handle.stats().dropped_bytes > 0);
    }

    #[tokio::test]
    async fn test_forwarder_copies_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_PIPE_FILE);
        let manager = LogPipeManager::new(LogMode::NamedPipes);
        let handle = manager.create(&path).await.unwrap().unwrap();
        let mut reader = manager.attach(&handle).unwrap();

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Vec<u8>>>();
        manager.forward(&handle, rx.boxed()).await;
        tx.unbounded_send(Ok(b"line one\n".to_vec())).unwrap();

        assert_eq!(read_some(&mut reader).await, b"line one\n");
        manager.release_all().await;
        assert!(manager.is_empty().await);
    }
}
