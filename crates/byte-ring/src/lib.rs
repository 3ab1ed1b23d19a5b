//! Circular Byte Buffer
//!
//! Provides the fixed-capacity byte ring sitting between a real-time
//! producer and the disk-write thread. Cursor accounting lives under a
//! single mutex; payload copies happen outside it and are published with
//! a commit step that detects concurrent cursor mutation.

mod ring;

pub use ring::{ByteRing, Cursors, DEFAULT_CAPACITY};

use thiserror::Error;

/// Ring buffer errors
#[derive(Debug, Clone, Error)]
pub enum RingError {
    /// A cursor moved while an uncommitted copy pass was in flight,
    /// which means the single-producer/single-consumer contract was broken
    #[error("{role} cursor moved from {expected} to {found} during an uncommitted pass")]
    CursorStolen {
        role: &'static str,
        expected: usize,
        found: usize,
    },

    /// Resize attempted while data is still buffered
    #[error("cannot resize with {used} bytes still buffered; flush first")]
    ResizePending { used: usize },
}
