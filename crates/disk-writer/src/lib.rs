//! Buffered Disk Writer
//!
//! Writes a recording byte stream to disk without blocking the producer.
//! One worker thread drains a ring buffer to the file descriptor, a second
//! periodically syncs the kernel's image of the file to hardware and drops
//! the written range from the page cache, so a synchronous disk stall never
//! reaches the capture pipeline.

mod storage;
mod writer;

pub use storage::{retry_write, FileStorage, StorageDev, WriteStatus};
pub use writer::{RecordingWriter, WriterConfig};

use thiserror::Error;

/// Disk writer errors
#[derive(Debug, Error)]
pub enum WriterError {
    /// Opening the destination file failed
    #[error("failed to open '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Ring buffer contract violation (resize with pending data, stolen cursor)
    #[error(transparent)]
    Ring(#[from] byte_ring::RingError),

    /// A worker thread could not be spawned
    #[error("worker thread failed to start: {0}")]
    Thread(std::io::Error),
}
