//! Storage device abstraction and the retrying write primitive

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

/// Destination a writer drains into.
///
/// `FileStorage` is the real device; tests substitute failure-injecting
/// doubles to exercise the retry and disk-full paths.
pub trait StorageDev: Send + Sync + 'static {
    /// Write as much of `buf` as the device accepts right now
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flush kernel write-back to stable storage (data, not metadata,
    /// where the platform allows)
    fn sync_data(&self) -> io::Result<()>;

    /// Advise the OS that the written range will not be read again soon.
    /// Best-effort; never fails the caller.
    fn drop_cache(&self);

    /// Reposition the write cursor
    fn seek(&self, pos: SeekFrom) -> io::Result<u64>;
}

/// Real file-backed storage
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl StorageDev for FileStorage {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn drop_cache(&self) {
        // Toss pages already handed to the kernel so preserving them does
        // not penalize us during the next sync.
        #[cfg(target_os = "linux")]
        unsafe {
            use std::os::unix::io::AsRawFd;
            libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }
    }

    fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        (&self.file).seek(pos)
    }
}

/// Outcome of a retrying write pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was handed to the device
    Complete,
    /// Retries were exhausted; a later pass may still succeed
    Failed,
    /// The device is permanently out of room (disk full or file size limit)
    NoSpace,
}

#[cfg(unix)]
fn is_no_space(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENOSPC) | Some(libc::EFBIG))
}

#[cfg(not(unix))]
fn is_no_space(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Other && e.to_string().contains("space")
}

/// Write `buf` to the device, retrying forever on the EAGAIN family and up
/// to three times on any other error. Out-of-room errors abort the pass
/// immediately and are reported as [`WriteStatus::NoSpace`].
pub fn retry_write(dev: &dyn StorageDev, buf: &[u8]) -> (usize, WriteStatus) {
    let mut total = 0;
    let mut errors = 0u32;

    while total < buf.len() {
        match dev.write(&buf[total..]) {
            Ok(n) => total += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                warn!("retry_write: transient error, retrying: {e}");
            }
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EFBIG) => {
                error!(
                    "retry_write: maximum file size exceeded; raise the process \
                     file-size limit or use a filesystem with large file support"
                );
                return (total, WriteStatus::NoSpace);
            }
            Err(e) if is_no_space(&e) => {
                error!(
                    "retry_write: no space left on device; the file will be \
                     truncated and no further writing will be done"
                );
                return (total, WriteStatus::NoSpace);
            }
            Err(e) => {
                errors += 1;
                error!(errors, "retry_write: I/O error: {e}");
                if errors >= 3 {
                    return (total, WriteStatus::Failed);
                }
            }
        }

        if total < buf.len() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    (total, WriteStatus::Complete)
}
