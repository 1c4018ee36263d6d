//! Stream writer: chunk creation, rotation and append.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::lock::{self, Flock};
use crate::naming::{self, ChunkNamer, TMP_SUFFIX, WRITER_LOCK_FILE};
use crate::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Largest partial line buffered in line-atomic mode. A single line beyond
/// this is force-flushed without the split guarantee, with a warning.
const LINE_BUF_LIMIT: usize = 1024 * 1024;

/// How appends are split across chunk boundaries. Fixed at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Split anywhere; a filled chunk is always exactly `max_chunk_size`.
    Binary,
    /// Split only at newline bytes; trailing partial lines are buffered
    /// across calls.
    Lines,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_chunk_size: u64,
    /// Allow attaching to an existing directory and continue its numbering.
    pub resume: bool,
    /// Share the stream with other concurrently attached writers.
    pub multi_writer: bool,
    pub mode: WriteMode,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            resume: false,
            multi_writer: false,
            mode: WriteMode::Binary,
        }
    }
}

#[derive(Debug)]
struct ActiveChunk {
    file: File,
    path: PathBuf,
    size: u64,
}

/// Appending side of a stream directory.
///
/// Owns the current chunk's exclusive advisory lock from creation to close;
/// readers interpret that lock as "still being written". Dropping the handle
/// detaches it, which closes (and thereby unlocks) the current chunk but
/// never deletes data.
#[derive(Debug)]
pub struct StreamWriter {
    root: PathBuf,
    max_chunk_size: u64,
    mode: WriteMode,
    namer: ChunkNamer,
    chunk: Option<ActiveChunk>,
    root_lock: Option<File>,
    rotate_requested: bool,
    line_buf: Vec<u8>,
}

impl StreamWriter {
    /// Attaches a writer to `root`, creating the directory and the first
    /// chunk.
    ///
    /// An existing directory is fatal unless resume or multi-writer mode is
    /// set. A conflicting writer already holding the root lock is fatal
    /// immediately: root-role conflicts are a misconfiguration, not a
    /// transient state.
    pub fn attach(root: impl AsRef<Path>, config: WriterConfig) -> Result<Self> {
        if config.max_chunk_size == 0 {
            return Err(Error::InvalidConfig("max chunk size must be positive"));
        }
        let root = root.as_ref().to_path_buf();

        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !config.resume && !config.multi_writer {
                    return Err(Error::AlreadyExists(root));
                }
            }
            Err(err) => return Err(err.into()),
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(root.join(WRITER_LOCK_FILE))?;
        let lock_mode = if config.multi_writer {
            Flock::Shared
        } else {
            Flock::Exclusive
        };
        if !lock::try_flock(&lock_file, lock_mode)? {
            return Err(Error::AlreadyActive {
                role: "writer",
                path: root,
            });
        }

        let namer = if config.multi_writer {
            let last = if config.resume {
                naming::highest_stamp(&root)?
            } else {
                None
            };
            ChunkNamer::multi(last)
        } else {
            let last = if config.resume {
                naming::highest_ordinal(&root)?.unwrap_or(0)
            } else {
                0
            };
            ChunkNamer::single(last)
        };

        let mut writer = Self {
            root,
            max_chunk_size: config.max_chunk_size,
            mode: config.mode,
            namer,
            chunk: None,
            root_lock: Some(lock_file),
            rotate_requested: false,
            line_buf: Vec::new(),
        };
        writer.create_next_chunk()?;
        Ok(writer)
    }

    /// Appends a block of stream bytes, rotating chunks at the size
    /// threshold per the configured mode.
    pub fn append(&mut self, buf: &[u8]) -> Result<()> {
        match self.mode {
            WriteMode::Binary => self.append_binary(buf),
            WriteMode::Lines => self.append_lines(buf),
        }
    }

    /// Requests rotation regardless of the size threshold. Honored at the
    /// next append boundary, not instantly; rotation is a latency
    /// optimization, not a correctness requirement.
    pub fn request_rotate(&mut self) {
        debug!("rotation requested");
        self.rotate_requested = true;
    }

    /// Forces any buffered partial line out. A no-op in binary mode.
    pub fn flush(&mut self) -> Result<()> {
        if self.line_buf.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.line_buf);
        self.append_line_block(&pending)
    }

    /// Closes the current chunk (releasing its lock so readers can finish
    /// it) and releases the root lock. Idempotent; never deletes data.
    pub fn detach(&mut self) -> Result<()> {
        if self.chunk.is_some() {
            self.flush()?;
        }
        if let Some(chunk) = self.chunk.take() {
            debug!("closing chunk {}", chunk.path.display());
            lock::unflock(&chunk.file)?;
        }
        if let Some(lock_file) = self.root_lock.take() {
            lock::unflock(&lock_file)?;
        }
        Ok(())
    }

    fn append_binary(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let remaining = {
                let chunk = self.chunk.as_ref().ok_or(Error::Detached)?;
                self.max_chunk_size - chunk.size
            };
            if buf.len() as u64 >= remaining {
                // This write tops the chunk off at exactly the threshold.
                // Create and lock the successor first so a reader observing
                // the filled chunk always has a next target, then finish and
                // close the old one.
                let fill = remaining as usize;
                let mut old = self.create_next_chunk()?.ok_or(Error::Detached)?;
                old.file.write_all(&buf[..fill])?;
                debug!(
                    "chunk {} filled at {} bytes",
                    old.path.display(),
                    self.max_chunk_size
                );
                buf = &buf[fill..];
                // old drops here: close releases the writer-activity lock
            } else {
                let chunk = self.chunk.as_mut().ok_or(Error::Detached)?;
                chunk.file.write_all(buf)?;
                chunk.size += buf.len() as u64;
                buf = &[];
                if self.rotate_requested {
                    self.roll()?;
                }
            }
        }
        Ok(())
    }

    fn append_lines(&mut self, buf: &[u8]) -> Result<()> {
        self.line_buf.extend_from_slice(buf);
        let Some(last_nl) = self.line_buf.iter().rposition(|&b| b == b'\n') else {
            if self.line_buf.len() > LINE_BUF_LIMIT {
                warn!("line exceeds {LINE_BUF_LIMIT} bytes, flushing without line-boundary guarantee");
                let pending = std::mem::take(&mut self.line_buf);
                self.append_binary(&pending)?;
            }
            return Ok(());
        };
        let rest = self.line_buf.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.line_buf, rest);
        self.append_line_block(&complete)
    }

    /// Writes a block so that any chunk boundary inside it falls on a
    /// newline. `block` normally ends with one; the final flush may not.
    fn append_line_block(&mut self, mut block: &[u8]) -> Result<()> {
        while !block.is_empty() {
            let (size, remaining) = {
                let chunk = self.chunk.as_ref().ok_or(Error::Detached)?;
                (chunk.size, self.max_chunk_size - chunk.size)
            };
            if (block.len() as u64) < remaining {
                let chunk = self.chunk.as_mut().ok_or(Error::Detached)?;
                chunk.file.write_all(block)?;
                chunk.size += block.len() as u64;
                block = &[];
                if self.rotate_requested {
                    self.roll()?;
                }
                continue;
            }
            // The block would fill or cross the threshold: cut at the last
            // newline that still fits.
            let fit = remaining as usize;
            match block[..fit].iter().rposition(|&b| b == b'\n') {
                Some(pos) => {
                    let cut = pos + 1;
                    let mut old = self.create_next_chunk()?.ok_or(Error::Detached)?;
                    old.file.write_all(&block[..cut])?;
                    block = &block[cut..];
                }
                None if size == 0 => {
                    // A single line longer than a whole chunk cannot honor
                    // the boundary guarantee.
                    warn!("line longer than max chunk size, splitting mid-line");
                    let (head, tail) = block.split_at(fit);
                    self.append_binary(head)?;
                    block = tail;
                }
                None => {
                    // The current chunk cannot take the next full line;
                    // start it on a fresh chunk.
                    self.roll()?;
                }
            }
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        let old = self.create_next_chunk()?;
        if let Some(old) = &old {
            debug!("rotated away from {} at {} bytes", old.path.display(), old.size);
        }
        Ok(())
    }

    /// Creates, locks and publishes the next chunk, returning the previous
    /// one still open so callers can finish writing into it before closing.
    ///
    /// The exclusive lock is taken while the file is still under its temp
    /// name; the atomic rename then guarantees that the instant a reader
    /// observes the final filename, the lock is already held.
    fn create_next_chunk(&mut self) -> Result<Option<ActiveChunk>> {
        let name = self.namer.next_name();
        let final_path = self.root.join(&name);
        let tmp_path = self.root.join(format!("{name}{TMP_SUFFIX}"));
        debug!("creating chunk {}", final_path.display());

        let file = match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::ChunkCollision(tmp_path));
            }
            Err(err) => return Err(err.into()),
        };
        lock::flock_blocking(&file, Flock::Exclusive)?;
        fs::rename(&tmp_path, &final_path)?;

        self.rotate_requested = false;
        Ok(self.chunk.replace(ActiveChunk {
            file,
            path: final_path,
            size: 0,
        }))
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            warn!("writer detach failed: {err}");
        }
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        StreamWriter::flush(self).map_err(into_io)
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
