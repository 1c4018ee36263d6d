//! Chunk naming schemes and directory discovery.
//!
//! Chunk names carry the stream's total order: lexicographic filename order
//! equals creation order. The single-writer scheme is a zero-padded ordinal;
//! the multi-writer scheme embeds a microsecond timestamp, a per-timestamp
//! counter, the process id and a random salt so concurrently running writers
//! can never collide and readers can merge their outputs by sorting names.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::Result;

pub const CHUNK_SUFFIX: &str = ".chunk";
pub const TMP_SUFFIX: &str = ".tmp";
pub const OFFSET_SUFFIX: &str = ".offset";
pub const WRITER_LOCK_FILE: &str = ".writer.lock";

/// Ordering key of a multi-writer chunk name: microsecond timestamp plus a
/// counter disambiguating chunks created within the same microsecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub ts_us: u64,
    pub seq: u32,
}

pub fn ordinal_filename(ordinal: u64) -> String {
    format!("{ordinal:010}{CHUNK_SUFFIX}")
}

pub fn stamped_filename(stamp: Stamp, pid: u32, salt: u32) -> String {
    format!(
        "{:016}.{:03}.{:05x}-{:08x}{CHUNK_SUFFIX}",
        stamp.ts_us,
        stamp.seq,
        pid & 0xf_ffff,
        salt
    )
}

/// Parses `NNNNNNNNNN.chunk`. Exactly ten digits, nothing else.
pub fn parse_ordinal(name: &str) -> Option<u64> {
    let base = name.strip_suffix(CHUNK_SUFFIX)?;
    if base.len() != 10 || !base.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok().filter(|&n| n > 0)
}

/// Parses `TTTTTTTTTTTTTTTT.CCC.PPPPP-RRRRRRRR.chunk` back into its ordering
/// key. The pid and salt fields only have to look like hex; their values do
/// not participate in ordering.
pub fn parse_stamped(name: &str) -> Option<Stamp> {
    let base = name.strip_suffix(CHUNK_SUFFIX)?;
    let bytes = base.as_bytes();
    if bytes.len() != 35 || bytes[16] != b'.' || bytes[20] != b'.' || bytes[26] != b'-' {
        return None;
    }
    let ts = &base[..16];
    let seq = &base[17..20];
    let pid = &base[21..26];
    let salt = &base[27..35];
    if !ts.bytes().all(|b| b.is_ascii_digit()) || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    if !is_hex(pid) || !is_hex(salt) {
        return None;
    }
    Some(Stamp {
        ts_us: ts.parse().ok()?,
        seq: seq.parse().ok()?,
    })
}

fn is_chunk_name(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(CHUNK_SUFFIX)
}

/// Lists chunk filenames in lexicographic (= stream) order. Dotfiles, temp
/// files and offset sidecars never match.
pub fn list_chunks(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if is_chunk_name(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Lowest ordinal present, the resume point of a single-reader attach.
pub fn lowest_ordinal(dir: &Path) -> Result<Option<u64>> {
    Ok(scan_ordinals(dir)?.into_iter().min())
}

/// Highest ordinal present, so a resumed writer continues without reuse.
pub fn highest_ordinal(dir: &Path) -> Result<Option<u64>> {
    Ok(scan_ordinals(dir)?.into_iter().max())
}

/// Highest stamped name present, the multi-writer resume point.
pub fn highest_stamp(dir: &Path) -> Result<Option<Stamp>> {
    let mut max = None;
    for name in list_chunks(dir)? {
        if let Some(stamp) = parse_stamped(&name) {
            if max.map_or(true, |m| stamp > m) {
                max = Some(stamp);
            }
        }
    }
    Ok(max)
}

fn scan_ordinals(dir: &Path) -> Result<Vec<u64>> {
    let mut ordinals = Vec::new();
    for name in list_chunks(dir)? {
        match parse_ordinal(&name) {
            Some(ordinal) => ordinals.push(ordinal),
            None => warn!("unable to parse chunk filename: {name}"),
        }
    }
    Ok(ordinals)
}

pub fn offset_path(chunk: &Path) -> PathBuf {
    let mut os = chunk.as_os_str().to_os_string();
    os.push(OFFSET_SUFFIX);
    PathBuf::from(os)
}

/// Deterministic name generator for the writer side. The variant is fixed at
/// attach time and names are strictly increasing by construction.
#[derive(Debug)]
pub enum ChunkNamer {
    Ordinal { last: u64 },
    Stamped { last: Option<Stamp> },
}

impl ChunkNamer {
    pub fn single(last: u64) -> Self {
        ChunkNamer::Ordinal { last }
    }

    pub fn multi(last: Option<Stamp>) -> Self {
        ChunkNamer::Stamped { last }
    }

    pub fn next_name(&mut self) -> String {
        match self {
            ChunkNamer::Ordinal { last } => {
                *last += 1;
                ordinal_filename(*last)
            }
            ChunkNamer::Stamped { last } => {
                let now = now_micros();
                let stamp = match *last {
                    // Same microsecond, or the clock stepped backwards: stay
                    // on the previous timestamp and bump the counter so names
                    // keep increasing. Counter exhaustion borrows the next
                    // microsecond.
                    Some(prev) if now <= prev.ts_us => {
                        if prev.seq >= 999 {
                            Stamp {
                                ts_us: prev.ts_us + 1,
                                seq: 0,
                            }
                        } else {
                            Stamp {
                                ts_us: prev.ts_us,
                                seq: prev.seq + 1,
                            }
                        }
                    }
                    _ => Stamp { ts_us: now, seq: 0 },
                };
                *last = Some(stamp);
                stamped_filename(stamp, std::process::id(), rand::random())
            }
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
