//! Claim arbitration against a competing process.
//!
//! POSIX record locks never conflict within one process, so a genuine
//! competitor has to live in a child process.

#![cfg(unix)]

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chunkpipe::{Error, ReaderConfig, StreamReader, StreamWriter, WriterConfig};
use tempfile::TempDir;

fn claiming_reader(stop: Option<Arc<AtomicBool>>) -> ReaderConfig {
    ReaderConfig {
        multi_reader: true,
        poll_interval: Duration::from_millis(1),
        claim_interval: Duration::from_millis(1),
        notify: false,
        stop,
        ..ReaderConfig::default()
    }
}

/// Forks a child that takes the claim byte lock on `path` and then sleeps
/// until killed. Returns once the child confirms it holds the lock.
fn claim_from_child(path: &Path) -> libc::pid_t {
    let c_path = CString::new(path.as_os_str().as_bytes()).expect("path bytes");
    let mut pipe = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        // child: raw syscalls only, the parent may hold allocator locks
        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDWR);
            let mut fl: libc::flock = std::mem::zeroed();
            fl.l_type = libc::F_WRLCK as libc::c_short;
            fl.l_whence = libc::SEEK_SET as libc::c_short;
            fl.l_start = 0;
            fl.l_len = 1;
            libc::fcntl(fd, libc::F_SETLK, &fl);
            libc::write(pipe[1], b"k".as_ptr().cast(), 1);
            libc::pause();
            libc::_exit(0);
        }
    }

    let mut ack = 0u8;
    unsafe {
        libc::close(pipe[1]);
        assert_eq!(libc::read(pipe[0], (&mut ack as *mut u8).cast(), 1), 1);
        libc::close(pipe[0]);
    }
    pid
}

fn reap(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, std::ptr::null_mut(), 0);
    }
}

#[test]
fn claimed_chunk_is_skipped_for_the_next_free_one() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("stream");

    let mut writer = StreamWriter::attach(
        &root,
        WriterConfig {
            max_chunk_size: 4,
            ..WriterConfig::default()
        },
    )
    .expect("writer");
    writer.append(b"aaaabbbb").expect("append");
    writer.detach().expect("detach");

    let pid = claim_from_child(&root.join("0000000001.chunk"));

    // the first chunk belongs to the child, so the scan must deliver the
    // second one
    let mut reader = StreamReader::attach(&root, claiming_reader(None)).expect("reader");
    let mut buf = [0u8; 4];
    let n = reader.read(&mut buf).expect("read");
    assert!(n > 0);
    assert!(buf[..n].iter().all(|&b| b == b'b'), "got {:?}", &buf[..n]);

    reap(pid);
}

#[test]
fn reader_waits_while_every_chunk_is_claimed() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("stream");

    let mut writer = StreamWriter::attach(
        &root,
        WriterConfig {
            max_chunk_size: 1024,
            ..WriterConfig::default()
        },
    )
    .expect("writer");
    writer.append(b"data").expect("append");
    writer.detach().expect("detach");

    let pid = claim_from_child(&root.join("0000000001.chunk"));

    let stop = Arc::new(AtomicBool::new(false));
    let stopper = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.store(true, Ordering::Relaxed);
    });

    // the only chunk is claimed elsewhere: the reader must poll, not consume
    // it and not declare end of stream
    let mut reader =
        StreamReader::attach(&root, claiming_reader(Some(Arc::clone(&stop)))).expect("reader");
    let mut buf = [0u8; 4];
    assert!(matches!(reader.read(&mut buf), Err(Error::Stopped)));
    assert_eq!(
        std::fs::read(root.join("0000000001.chunk")).expect("chunk intact"),
        b"data"
    );

    handle.join().expect("stopper thread");
    reap(pid);
}
