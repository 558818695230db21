use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::Span;

use super::record;
use super::sync_compressed::CompressedLog;
use super::{encode_replacement, stream_options, LogEntries, ReadOptions, WriteAheadLog};
use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::hasher::Crc32Engine;

enum Command {
    Append(Vec<u8>),
    /// Barrier: replies once everything queued before it is durable.
    Flush(Sender<Result<()>>),
    Stop,
}

/// Block-compressed log written by a dedicated background thread.
///
/// `append` only enqueues the encoded record and never waits for I/O.
/// Records still queued when the process dies are lost, so this strategy is
/// not durable; replay sorts by operation index to restore logical order.
/// When the queue stays empty for `empty_queue_poll_interval` the writer
/// persists its unfinished block to `<path>.tail`.
pub struct AsyncCompressedWal {
    path: PathBuf,
    engine: Crc32Engine,
    log: Arc<Mutex<CompressedLog>>,
    // Appends and replacement both go through this lock. `None` once frozen.
    queue: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl std::fmt::Debug for AsyncCompressedWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCompressedWal")
            .field("path", &self.path)
            .finish()
    }
}

impl AsyncCompressedWal {
    pub fn open(path: PathBuf, config: &WalConfig, engine: Crc32Engine, span: Span) -> Result<Self> {
        let log = CompressedLog::open(path.clone(), config, stream_options(config, engine))?;
        let log = Arc::new(Mutex::new(log));

        let (tx, rx) = unbounded();
        let worker = {
            let log = log.clone();
            let poll = config.empty_queue_poll_interval;
            let span = span.clone();
            std::thread::Builder::new()
                .name("wal-writer".into())
                .spawn(move || run_writer(rx, log, poll, span))?
        };

        Ok(Self {
            path,
            engine,
            log,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            span,
        })
    }

    /// Waits until the writer has applied everything queued so far. Once the
    /// log is frozen this waits for the writer thread to finish instead.
    fn barrier(&self, queue: &Option<Sender<Command>>) -> Result<()> {
        match queue {
            Some(tx) => {
                let (reply, done) = bounded(1);
                tx.send(Command::Flush(reply))
                    .map_err(|_| Error::InvalidState("log writer has stopped".into()))?;
                done.recv()
                    .map_err(|_| Error::InvalidState("log writer has stopped".into()))?
            }
            None => {
                self.join_writer();
                Ok(())
            }
        }
    }

    fn stop_writer(&self) {
        if let Some(tx) = self.queue.lock().take() {
            let _ = tx.send(Command::Stop);
        }
    }

    fn join_writer(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(parent: &self.span, path = ?self.path, "Log writer panicked");
            }
        }
    }
}

fn run_writer(
    commands: Receiver<Command>,
    log: Arc<Mutex<CompressedLog>>,
    poll: Duration,
    span: Span,
) {
    loop {
        match commands.recv_timeout(poll) {
            Ok(Command::Append(bytes)) => {
                if let Err(e) = log.lock().write(&bytes) {
                    tracing::error!(parent: &span, error = %e, "Failed to write log record");
                }
            }
            Ok(Command::Flush(reply)) => {
                let _ = reply.send(log.lock().flush());
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => {
                if let Err(e) = log.lock().freeze() {
                    tracing::error!(parent: &span, error = %e, "Failed to seal log");
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = log.lock().write_tail() {
                    tracing::warn!(parent: &span, error = %e, "Tail write failed");
                }
            }
        }
    }
}

impl WriteAheadLog for AsyncCompressedWal {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, key: &[u8], value: &[u8], op_index: i64) -> Result<()> {
        let buf = record::encode(self.engine, key, value, op_index)?;
        match &*self.queue.lock() {
            Some(tx) => tx
                .send(Command::Append(buf))
                .map_err(|_| Error::LogFrozen(self.path.clone())),
            None => Err(Error::LogFrozen(self.path.clone())),
        }
    }

    fn read_log_entries(&self, options: ReadOptions) -> Result<LogEntries> {
        let queue = self.queue.lock();
        self.barrier(&queue)?;
        self.log.lock().read(options)
    }

    fn replace_write_ahead_log(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        disable_backup: bool,
    ) -> Result<i64> {
        let content = encode_replacement(self.engine, keys, values)?;
        let queue = self.queue.lock();
        self.barrier(&queue)?;
        self.log.lock().replace(&content, disable_backup, &self.span)
    }

    /// Returns immediately; the writer seals the log after draining the queue.
    fn mark_frozen(&self) -> Result<()> {
        self.stop_writer();
        Ok(())
    }

    fn truncate_incomplete_tail_record(&self, position: u64) -> Result<()> {
        let queue = self.queue.lock();
        self.barrier(&queue)?;
        self.log.lock().truncate(position, &self.span)
    }

    fn flush(&self) -> Result<()> {
        let queue = self.queue.lock();
        self.barrier(&queue)
    }

    fn drop_log(&self) -> Result<()> {
        self.stop_writer();
        self.join_writer();
        self.log.lock().remove_files()
    }
}

impl Drop for AsyncCompressedWal {
    fn drop(&mut self) {
        self.stop_writer();
        self.join_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityMode;
    use crate::wal::{sibling, TAIL_SUFFIX};
    use tempfile::TempDir;

    fn open(path: &Path, poll: Duration) -> AsyncCompressedWal {
        let config = WalConfig::default()
            .durability_mode(DurabilityMode::AsyncCompressed)
            .empty_queue_poll_interval(poll);
        AsyncCompressedWal::open(
            path.to_path_buf(),
            &config,
            Crc32Engine::detect().unwrap(),
            Span::none(),
        )
        .unwrap()
    }

    #[test]
    fn test_idle_writer_persists_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let wal = open(&path, Duration::from_millis(5));

        wal.append(b"k", b"v", 0).unwrap();
        let tail = sibling(&path, TAIL_SUFFIX);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !tail.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(tail.exists());
    }

    #[test]
    fn test_concurrent_appends_replay_in_op_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let wal = open(&path, Duration::from_millis(50));
        let next = std::sync::atomic::AtomicI64::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let op = next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        wal.append(&op.to_be_bytes(), b"v", op).unwrap();
                    }
                });
            }
        });

        let entries = wal.read_log_entries(ReadOptions::new(true, true, true)).unwrap();
        assert!(entries.success);
        assert_eq!(entries.op_indexes, (0..400).collect::<Vec<i64>>());
        for (key, op) in entries.keys.iter().zip(&entries.op_indexes) {
            assert_eq!(key, &op.to_be_bytes());
        }
    }

    #[test]
    fn test_frozen_log_is_sealed_by_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.wal");
        let wal = open(&path, Duration::from_secs(60));

        for i in 0..10 {
            wal.append(b"k", &[i as u8], i).unwrap();
        }
        wal.mark_frozen().unwrap();
        assert!(matches!(wal.append(b"k", b"x", 10), Err(Error::LogFrozen(_))));

        let entries = wal.read_log_entries(ReadOptions::default()).unwrap();
        assert_eq!(entries.len(), 10);
        assert!(!sibling(&path, TAIL_SUFFIX).exists());
    }
}
