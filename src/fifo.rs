//! Named-pipe transport of one chunk's BAM stream to the external process.
//!
//! Opening a FIFO for writing blocks until a reader appears, so the
//! helper thread first probes with a nonblocking open every 50 ms; the
//! external process can therefore be spawned first without a race. Once
//! the reader is connected the BAM writer reopens the pipe blocking,
//! which returns immediately, and the probe fd is dropped.

use crate::errors::{AppError, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use rust_htslib::bam;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn create_fifo(path: &Path) -> Result<()> {
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)).map_err(|errno| {
        AppError::FifoSetup {
            path: path.display().to_string(),
            reason: errno.to_string(),
        }
    })
}

/// Handle on the helper thread streaming one chunk into its FIFO.
pub struct FifoWriter {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

/// Spawns the writer thread. Call only after the external process has
/// been spawned, so the open poll terminates quickly.
pub fn spawn_chunk_writer(
    fifo_path: PathBuf,
    header: bam::Header,
    reads: Vec<bam::Record>,
    abort: Arc<AtomicBool>,
) -> FifoWriter {
    let cancel = Arc::new(AtomicBool::new(false));
    let thread_cancel = Arc::clone(&cancel);
    let handle =
        thread::spawn(move || write_chunk(&fifo_path, &header, &reads, &thread_cancel, &abort));
    FifoWriter { cancel, handle }
}

impl FifoWriter {
    /// Cancels the open poll if the reader never connected (the external
    /// process is already gone by the time this is called) and joins the
    /// thread.
    pub fn finish(self) -> Result<()> {
        self.cancel.store(true, Ordering::SeqCst);
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(AppError::ParseError {
                message: "FIFO writer thread panicked".to_string(),
            }),
        }
    }
}

fn write_chunk(
    path: &Path,
    header: &bam::Header,
    reads: &[bam::Record],
    cancel: &AtomicBool,
    abort: &AtomicBool,
) -> Result<()> {
    let Some(probe_fd) = wait_for_reader(path, cancel, abort)? else {
        return Ok(());
    };
    // the reader must never observe a zero-writer window, so the probe fd
    // is released only once the blocking writer holds its own handle
    let writer = bam::Writer::from_path(path, header, bam::Format::Bam);
    let _ = nix::unistd::close(probe_fd);
    let mut writer = writer?;
    writer.set_compression_level(bam::CompressionLevel::Uncompressed)?;
    for record in reads {
        writer.write(record)?;
    }
    // writer drop closes the pipe; the external reader sees EOF
    Ok(())
}

/// Probes the write end until the external reader opens its end. Returns
/// `None` when cancelled or the run aborted before a reader appeared.
fn wait_for_reader(
    path: &Path,
    cancel: &AtomicBool,
    abort: &AtomicBool,
) -> Result<Option<RawFd>> {
    loop {
        if cancel.load(Ordering::SeqCst) || abort.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match nix::fcntl::open(path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
            Ok(fd) => return Ok(Some(fd)),
            Err(Errno::ENXIO) => thread::sleep(OPEN_POLL_INTERVAL),
            Err(errno) => {
                return Err(AppError::FifoSetup {
                    path: path.display().to_string(),
                    reason: errno.to_string(),
                });
            }
        }
    }
}
