use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::{Parser, Subcommand};

use chunkpipe::{
    Error, ReaderConfig, StreamReader, StreamWriter, WriteMode, WriterConfig, DEFAULT_CHUNK_SIZE,
};

#[derive(Parser)]
#[command(name = "chunkpipe", version, about = "Stream bytes through a directory of chunk files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append stdin into the stream directory
    Write {
        dir: PathBuf,
        /// Maximum chunk size in bytes
        #[arg(short = 's', long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        /// Rotate chunks every N seconds regardless of size
        #[arg(short = 't', long = "rotate-every")]
        rotate_every: Option<u32>,
        /// Reattach to an existing stream directory
        #[arg(long)]
        resume: bool,
        /// Share the stream with other concurrently running writers
        #[arg(long = "multi-writer")]
        multi_writer: bool,
        /// Split chunks only at line boundaries
        #[arg(long)]
        lines: bool,
    },
    /// Stream the directory's chunks to stdout
    Read {
        dir: PathBuf,
        /// Share the stream with other concurrently running readers
        #[arg(short = 'm', long = "multi-reader")]
        multi_reader: bool,
        /// Keep waiting for new chunks after the writer detaches
        #[arg(long)]
        persistent: bool,
        /// Wait for the stream directory to appear
        #[arg(long = "wait")]
        wait_for_root: bool,
    },
}

static ROTATE: AtomicBool = AtomicBool::new(false);
static ALARM_SECS: AtomicU32 = AtomicU32::new(0);
static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_alarm(_sig: libc::c_int) {
    ROTATE.store(true, Ordering::Relaxed);
    unsafe {
        libc::alarm(ALARM_SECS.load(Ordering::Relaxed));
    }
}

extern "C" fn on_terminate(_sig: libc::c_int) {
    if let Some(stop) = STOP.get() {
        stop.store(true, Ordering::Relaxed);
    }
}

extern "C" fn on_io(_sig: libc::c_int) {
    // nothing to do: delivery alone wakes the poll sleep
}

fn install(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    unsafe {
        libc::signal(sig, handler as libc::sighandler_t);
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn run() -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let _ = STOP.set(Arc::clone(&stop));
    install(libc::SIGINT, on_terminate);
    install(libc::SIGTERM, on_terminate);

    match Cli::parse().command {
        Commands::Write {
            dir,
            chunk_size,
            rotate_every,
            resume,
            multi_writer,
            lines,
        } => {
            let config = WriterConfig {
                max_chunk_size: chunk_size,
                resume,
                multi_writer,
                mode: if lines { WriteMode::Lines } else { WriteMode::Binary },
            };
            run_write(&dir, config, rotate_every, &stop)
        }
        Commands::Read {
            dir,
            multi_reader,
            persistent,
            wait_for_root,
        } => {
            install(libc::SIGIO, on_io);
            let config = ReaderConfig {
                multi_reader,
                persistent,
                wait_for_root,
                stop: Some(Arc::clone(&stop)),
                ..ReaderConfig::default()
            };
            run_read(&dir, config)
        }
    }
}

fn run_write(
    dir: &PathBuf,
    config: WriterConfig,
    rotate_every: Option<u32>,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let mut writer = StreamWriter::attach(dir, config)?;

    if let Some(secs) = rotate_every {
        ALARM_SECS.store(secs, Ordering::Relaxed);
        install(libc::SIGALRM, on_alarm);
        unsafe {
            libc::alarm(secs);
        }
    }

    let mut stdin = io::stdin().lock();
    let mut buf = [0u8; 64 * 1024];
    while !stop.load(Ordering::Relaxed) {
        if ROTATE.swap(false, Ordering::Relaxed) {
            writer.request_rotate();
        }
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => writer.append(&buf[..n])?,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("reading stdin"),
        }
    }
    writer.detach()?;
    Ok(())
}

fn run_read(dir: &PathBuf, config: ReaderConfig) -> anyhow::Result<()> {
    let mut reader = StreamReader::attach(dir, config)?;
    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => stdout.write_all(&buf[..n]).context("writing stdout")?,
            Err(Error::Stopped) => break,
            Err(err) => return Err(err.into()),
        }
    }
    reader.detach()?;
    stdout.flush()?;
    Ok(())
}

/// Non-zero exit status derived from the underlying OS error when there is
/// one.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(code) = io_err.raw_os_error() {
                let code = code & 0xff;
                if code != 0 {
                    return code;
                }
            }
        }
    }
    255
}
