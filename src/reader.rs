//! Stream reader: chunk discovery, claim arbitration and consumption.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::checkpoint;
use crate::lock::{self, Flock, CLAIM_BYTE};
use crate::naming::{self, WRITER_LOCK_FILE};
use crate::notify::DirWatch;
use crate::wait::sleep_interruptible;
use crate::{Error, Result};

/// What to do when an offset checkpoint cannot be parsed or applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetPolicy {
    /// Warn and reread the chunk from the start. May deliver duplicate
    /// bytes; this is the documented at-least-once tradeoff.
    Restart,
    /// Fail the open instead of risking duplicate delivery.
    Fail,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Claim chunks via byte-range locks so several readers can share one
    /// stream; each chunk is still delivered to exactly one reader.
    pub multi_reader: bool,
    /// Keep waiting for new chunks even when no writer is attached.
    pub persistent: bool,
    /// Poll for the directory (and a first chunk) to appear instead of
    /// failing when attaching before any writer.
    pub wait_for_root: bool,
    /// Sleep between polls for chunk completion or arrival.
    pub poll_interval: Duration,
    /// Sleep between claim-scan retries when every chunk is taken.
    pub claim_interval: Duration,
    /// Arm a directory-change notification to shorten poll latency.
    pub notify: bool,
    pub offset_policy: OffsetPolicy,
    /// Cooperative shutdown flag, typically set from a signal handler. When
    /// observed during a poll, `read` returns `Error::Stopped` so the caller
    /// can run the same teardown as a clean detach.
    pub stop: Option<Arc<AtomicBool>>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            multi_reader: false,
            persistent: false,
            wait_for_root: false,
            poll_interval: Duration::from_millis(100),
            claim_interval: Duration::from_millis(10),
            notify: true,
            offset_policy: OffsetPolicy::Restart,
            stop: None,
        }
    }
}

#[derive(Debug)]
struct OpenChunk {
    file: File,
    path: PathBuf,
    /// Bytes delivered so far, including any resumed checkpoint offset.
    position: u64,
}

enum NextChunk {
    Opened(OpenChunk),
    /// Nothing consumable right now; poll again after the given interval.
    Wait(Duration),
    EndOfStream,
}

/// Consuming side of a stream directory.
///
/// Chunks are read strictly in name order, deleted once confirmed closed and
/// fully drained, and the directory itself is removed at end of stream. The
/// handle's `detach` is idempotent and checkpoints a partially consumed
/// chunk so a later attach resumes mid-chunk.
#[derive(Debug)]
pub struct StreamReader {
    root: PathBuf,
    cfg: ReaderConfig,
    root_lock: Option<File>,
    watch: Option<DirWatch>,
    next_ordinal: u64,
    current: Option<OpenChunk>,
    finished: bool,
}

impl StreamReader {
    pub fn attach(root: impl AsRef<Path>, cfg: ReaderConfig) -> Result<Self> {
        if cfg.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive"));
        }
        let root = root.as_ref().to_path_buf();

        if cfg.wait_for_root {
            loop {
                if stop_requested(&cfg.stop) {
                    return Err(Error::Stopped);
                }
                if has_any_chunk(&root)? {
                    break;
                }
                sleep_interruptible(cfg.poll_interval);
            }
        }

        let dir = File::open(&root)?;
        let lock_mode = if cfg.multi_reader {
            Flock::Shared
        } else {
            Flock::Exclusive
        };
        if !lock::try_flock(&dir, lock_mode)? {
            return Err(Error::AlreadyActive {
                role: "reader",
                path: root,
            });
        }

        let watch = if cfg.notify {
            match DirWatch::new(&root) {
                Ok(watch) => Some(watch),
                Err(err) => {
                    warn!("directory notification unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };

        // In multi-reader mode the chunk to read is chosen by the claim
        // scan; single-reader mode resumes from the lowest ordinal present.
        let next_ordinal = if cfg.multi_reader {
            0
        } else {
            naming::lowest_ordinal(&root)?.map_or(0, |n| n - 1)
        };
        debug!("attached reader at chunk #{}", next_ordinal + 1);

        Ok(Self {
            root,
            cfg,
            root_lock: Some(dir),
            watch,
            next_ordinal,
            current: None,
            finished: false,
        })
    }

    /// Reads the next bytes of the stream.
    ///
    /// Returns any positive count immediately; never blocks to fill the
    /// buffer. `Ok(0)` is the terminal end-of-stream signal, returned only
    /// after the drained directory has been cleaned up.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        if self.root_lock.is_none() {
            return Err(Error::Detached);
        }
        loop {
            if stop_requested(&self.cfg.stop) {
                return Err(Error::Stopped);
            }
            if self.current.is_none() {
                match self.open_next_chunk()? {
                    NextChunk::Opened(chunk) => self.current = Some(chunk),
                    NextChunk::Wait(interval) => {
                        self.poll_wait(interval);
                        continue;
                    }
                    NextChunk::EndOfStream => {
                        debug!("end of stream detected");
                        self.finish_stream();
                        self.finished = true;
                        return Ok(0);
                    }
                }
            }
            let chunk = self.current.as_mut().ok_or(Error::Detached)?;
            match chunk.file.read(buf) {
                Ok(0) => {
                    // Nothing to read: probe whether the writer released the
                    // chunk. Acquiring its lock means the chunk is finished.
                    if lock::try_flock(&chunk.file, Flock::Exclusive)? {
                        self.discard_current()?;
                        continue;
                    }
                    self.poll_wait(self.cfg.poll_interval);
                }
                Ok(n) => {
                    chunk.position += n as u64;
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Checkpoints a partially consumed chunk and releases all locks.
    /// Idempotent; safe to call from a signal-driven teardown path.
    pub fn detach(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.take() {
            if chunk.position > 0 {
                let sidecar = naming::offset_path(&chunk.path);
                checkpoint::store(&sidecar, chunk.position)?;
                debug!(
                    "checkpointed {} at offset {}",
                    chunk.path.display(),
                    chunk.position
                );
            }
        }
        self.root_lock = None;
        Ok(())
    }

    fn open_next_chunk(&mut self) -> Result<NextChunk> {
        if self.cfg.multi_reader {
            self.claim_next_chunk()
        } else {
            self.open_next_ordinal()
        }
    }

    fn open_next_ordinal(&mut self) -> Result<NextChunk> {
        let path = self.root.join(naming::ordinal_filename(self.next_ordinal + 1));
        match File::open(&path) {
            Ok(file) => {
                self.next_ordinal += 1;
                debug!("opened chunk {}", path.display());
                Ok(NextChunk::Opened(self.resume_chunk(file, path)?))
            }
            // Not yet written is not an error; whether to wait depends on
            // writer presence and persistence.
            Err(err) if err.kind() == io::ErrorKind::NotFound => self.stall_or_finish(),
            Err(err) => Err(err.into()),
        }
    }

    /// Scans the directory in sorted order and claims the first chunk no
    /// other reader holds.
    fn claim_next_chunk(&mut self) -> Result<NextChunk> {
        let names = naming::list_chunks(&self.root)?;
        if names.is_empty() {
            return self.stall_or_finish();
        }
        for name in names {
            let path = self.root.join(&name);
            // Read-write open: POSIX write locks need a writable descriptor.
            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // consumed by a competitor between listing and opening
                    debug!("chunk {name} gone before open");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if !lock::try_lock_byte(&file, CLAIM_BYTE)? {
                debug!("chunk {name} claimed by another reader");
                continue;
            }
            // The claim may have landed on a file a competitor unlinked
            // between our listing and the lock.
            match fs::metadata(&path) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("chunk {name} gone after claim");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            debug!("claimed chunk {}", path.display());
            return Ok(NextChunk::Opened(self.resume_chunk(file, path)?));
        }
        // Chunks exist but every one is claimed; poll rather than block.
        Ok(NextChunk::Wait(self.cfg.claim_interval))
    }

    fn stall_or_finish(&self) -> Result<NextChunk> {
        if self.cfg.persistent || self.writer_attached()? {
            Ok(NextChunk::Wait(self.cfg.poll_interval))
        } else {
            Ok(NextChunk::EndOfStream)
        }
    }

    /// Applies a prior offset checkpoint, if any, to a freshly opened chunk.
    fn resume_chunk(&self, mut file: File, path: PathBuf) -> Result<OpenChunk> {
        let sidecar = naming::offset_path(&path);
        let mut position = 0;
        let resumed = match checkpoint::load(&sidecar) {
            Ok(None) => None,
            Ok(Some(offset)) => match file.seek(SeekFrom::Start(offset)) {
                Ok(_) => Some(offset),
                Err(err) => {
                    self.reject_checkpoint(&sidecar, &Error::Io(err))?;
                    None
                }
            },
            Err(err) => {
                self.reject_checkpoint(&sidecar, &err)?;
                None
            }
        };
        if let Some(offset) = resumed {
            debug!("resuming {} at offset {offset}", path.display());
            position = offset;
        }
        Ok(OpenChunk {
            file,
            path,
            position,
        })
    }

    fn reject_checkpoint(&self, sidecar: &Path, err: &Error) -> Result<()> {
        match self.cfg.offset_policy {
            OffsetPolicy::Restart => {
                warn!(
                    "ignoring offset checkpoint '{}' ({err}), rereading from start",
                    sidecar.display()
                );
                Ok(())
            }
            OffsetPolicy::Fail => Err(Error::BadCheckpoint(sidecar.to_path_buf())),
        }
    }

    /// Deletes a confirmed-closed, fully drained chunk and its sidecar.
    fn discard_current(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.take() {
            debug!("chunk {} drained, removing", chunk.path.display());
            match fs::remove_file(&chunk.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!("chunk {} already removed", chunk.path.display());
                }
                Err(err) => return Err(err.into()),
            }
            checkpoint::remove(&naming::offset_path(&chunk.path));
            // chunk.file drops here, releasing the completion probe lock and
            // any claim lock
        }
        Ok(())
    }

    /// Probes the `.writer.lock` marker. An exclusive attempt fails while
    /// any writer, shared or exclusive, holds it.
    fn writer_attached(&self) -> Result<bool> {
        let file = match File::open(self.root.join(WRITER_LOCK_FILE)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        Ok(!lock::try_flock(&file, Flock::Exclusive)?)
    }

    /// End-of-stream cleanup: best-effort removal of the writer-lock marker
    /// and the drained directory. Losing a race here (a competing reader, or
    /// a writer attaching at this very moment) is not an error.
    fn finish_stream(&mut self) {
        debug!("removing stream directory {}", self.root.display());
        let marker = self.root.join(WRITER_LOCK_FILE);
        if let Err(err) = fs::remove_file(&marker) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("unable to remove '{}': {err}", marker.display());
            }
        }
        // release our own directory lock before removing the directory
        self.root_lock = None;
        if let Err(err) = fs::remove_dir(&self.root) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("unable to remove '{}': {err}", self.root.display());
            }
        }
    }

    fn poll_wait(&self, interval: Duration) {
        if let Some(watch) = &self.watch {
            watch.arm();
        }
        sleep_interruptible(interval);
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            warn!("reader detach failed: {err}");
        }
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StreamReader::read(self, buf).map_err(|err| match err {
            Error::Io(err) => err,
            Error::Stopped => io::Error::new(io::ErrorKind::Interrupted, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        })
    }
}

fn stop_requested(stop: &Option<Arc<AtomicBool>>) -> bool {
    stop.as_ref().map_or(false, |flag| flag.load(Ordering::Relaxed))
}

fn has_any_chunk(root: &Path) -> Result<bool> {
    match naming::list_chunks(root) {
        Ok(names) => Ok(!names.is_empty()),
        Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
