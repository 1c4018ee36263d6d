//! Offset checkpoints: mid-chunk resume positions persisted across restarts.
//!
//! A sidecar file `<chunk>.offset` holds the last confirmed-read byte
//! position as decimal ASCII plus a newline. Written by the reader on clean
//! shutdown while a chunk is partially consumed, consulted on the next open
//! of that same chunk, and deleted together with the chunk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use log::warn;

use crate::{Error, Result};

pub fn store(path: &Path, offset: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(format!("{offset}\n").as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Returns `None` when no checkpoint exists. Unparsable contents surface as
/// `BadCheckpoint`; the caller's offset policy decides what that means.
pub fn load(path: &Path) -> Result<Option<u64>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    contents
        .trim_end_matches('\n')
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::BadCheckpoint(path.to_path_buf()))
}

/// Best-effort removal; a missing sidecar is the common case.
pub fn remove(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("unable to remove offset checkpoint '{}': {err}", path.display());
        }
    }
}
