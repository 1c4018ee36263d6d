//! Persistent, filesystem-resident, single-producer/multi-consumer byte
//! stream.
//!
//! A writer appends a byte stream into a sequence of immutable chunk files
//! inside a directory; readers consume the chunks in order and delete them
//! once fully read. The directory itself is the durable queue, and advisory
//! file locks on the chunks and on a root marker are the whole coordination
//! protocol: there is no server and no shared memory, so writers and readers
//! survive restarts, crashes and concurrent peers.
//!
//! See [`writer::StreamWriter`] and [`reader::StreamReader`] for the two
//! sides of the protocol, and [`lock`] for the lock conventions they share.

pub mod checkpoint;
pub mod error;
pub mod lock;
pub mod naming;
pub mod notify;
pub mod reader;
pub mod wait;
pub mod writer;

pub use error::{Error, Result};
pub use reader::{OffsetPolicy, ReaderConfig, StreamReader};
pub use writer::{StreamWriter, WriteMode, WriterConfig, DEFAULT_CHUNK_SIZE};
