//! Ring buffer implementation

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use crate::RingError;

/// Default buffer capacity (2 MiB, roughly one second of HD transport stream)
pub const DEFAULT_CAPACITY: usize = 2 * 1024 * 1024;

/// Read/write cursor state, always accessed under the ring's mutex.
///
/// One byte of capacity is reserved so a full buffer (`wpos` one slot behind
/// `rpos`) is distinguishable from an empty one (`wpos == rpos`).
#[derive(Debug)]
pub struct Cursors {
    rpos: usize,
    wpos: usize,
    capacity: usize,
}

impl Cursors {
    /// Bytes queued for the consumer
    pub fn used(&self) -> usize {
        if self.wpos >= self.rpos {
            self.wpos - self.rpos
        } else {
            self.capacity - self.rpos + self.wpos
        }
    }

    /// Bytes the producer can copy in without blocking
    pub fn free(&self) -> usize {
        self.capacity - self.used() - 1
    }

    /// Current producer cursor
    pub fn write_pos(&self) -> usize {
        self.wpos
    }

    /// Current consumer cursor
    pub fn read_pos(&self) -> usize {
        self.rpos
    }

    /// Total allocation; usable payload capacity is one byte less
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fixed-capacity circular byte store with independent read/write cursors.
///
/// Designed for one producer and one consumer. Cursor bookkeeping is
/// mutex-guarded, but payload copies deliberately run outside the lock:
/// a caller snapshots its cursor under the lock, releases it, copies, and
/// then commits. The commit re-checks the cursor and rejects the pass if
/// another thread moved it, so a contract violation is loud instead of
/// silently corrupting the accounting.
pub struct ByteRing {
    storage: UnsafeCell<Box<[u8]>>,
    /// Mirrors `Cursors::capacity` for the unlocked copy paths
    cap: AtomicUsize,
    cursors: Mutex<Cursors>,
}

// SAFETY: the storage cell is only touched through the cursor reservation
// protocol; disjoint producer/consumer regions never alias.
unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Create a ring with the given total capacity (at least two bytes,
    /// one of which is reserved for full/empty disambiguation).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");
        Self {
            storage: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            cap: AtomicUsize::new(capacity),
            cursors: Mutex::new(Cursors {
                rpos: 0,
                wpos: 0,
                capacity,
            }),
        }
    }

    /// Create a ring with the default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Total allocation size
    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Relaxed)
    }

    /// Lock the cursors for a multi-step decision
    pub fn lock(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock()
    }

    /// Bytes queued for the consumer, with locking
    pub fn used(&self) -> usize {
        self.cursors.lock().used()
    }

    /// Bytes the producer can copy in without blocking, with locking
    pub fn free(&self) -> usize {
        self.cursors.lock().free()
    }

    /// Copy `data` into the ring starting at `wpos`, wrapping into two
    /// segments when the copy straddles the end of the buffer.
    ///
    /// `wpos` and the length must come from a reservation made under the
    /// cursor lock (`lock()` then `write_pos()`/`free()`), and the copy must
    /// be published afterwards with [`commit_write`](Self::commit_write).
    pub fn copy_in(&self, wpos: usize, data: &[u8]) {
        let capacity = self.cap.load(Ordering::Relaxed);
        debug_assert!(data.len() < capacity);

        // SAFETY: the reservation protocol guarantees [wpos, wpos + len)
        // is free space no other thread touches until the commit.
        unsafe {
            let base = (*self.storage.get()).as_ptr() as *mut u8;
            if wpos + data.len() > capacity {
                let first = capacity - wpos;
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(wpos), first);
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    base,
                    data.len() - first,
                );
            } else {
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(wpos), data.len());
            }
        }
    }

    /// Publish a completed `copy_in` by advancing the write cursor.
    ///
    /// Fails if the cursor is no longer at `expected`, which means a second
    /// producer raced this one.
    pub fn commit_write(&self, expected: usize, len: usize) -> Result<(), RingError> {
        let mut cursors = self.cursors.lock();
        if cursors.wpos != expected {
            error!(
                expected,
                found = cursors.wpos,
                "write cursor moved during an uncommitted producer pass"
            );
            return Err(RingError::CursorStolen {
                role: "write",
                expected,
                found: cursors.wpos,
            });
        }
        cursors.wpos = (cursors.wpos + len) % cursors.capacity;
        Ok(())
    }

    /// Borrow `len` readable bytes starting at `rpos` as at most two slices
    /// (second is empty unless the range wraps).
    ///
    /// `rpos` and `len` must come from a reservation made under the cursor
    /// lock, and the consumer must publish with
    /// [`commit_read`](Self::commit_read) once done with the slices.
    pub fn read_segments(&self, rpos: usize, len: usize) -> (&[u8], &[u8]) {
        let capacity = self.cap.load(Ordering::Relaxed);
        debug_assert!(len < capacity);

        // SAFETY: the reservation protocol guarantees [rpos, rpos + len)
        // holds committed data the producer will not overwrite until the
        // consumer commits.
        unsafe {
            let base = (*self.storage.get()).as_ptr();
            if rpos + len > capacity {
                let first = capacity - rpos;
                (
                    std::slice::from_raw_parts(base.add(rpos), first),
                    std::slice::from_raw_parts(base, len - first),
                )
            } else {
                (std::slice::from_raw_parts(base.add(rpos), len), &[])
            }
        }
    }

    /// Publish a completed read by advancing the read cursor.
    ///
    /// Fails if the cursor is no longer at `expected`, which means a second
    /// consumer raced this one.
    pub fn commit_read(&self, expected: usize, len: usize) -> Result<(), RingError> {
        let mut cursors = self.cursors.lock();
        if cursors.rpos != expected {
            error!(
                expected,
                found = cursors.rpos,
                "read cursor moved during an uncommitted consumer pass"
            );
            return Err(RingError::CursorStolen {
                role: "read",
                expected,
                found: cursors.rpos,
            });
        }
        cursors.rpos = (cursors.rpos + len) % cursors.capacity;
        Ok(())
    }

    /// Replace the storage with a new allocation of `new_capacity` bytes.
    ///
    /// Buffered data is not preserved: the call is rejected while any bytes
    /// are pending, so callers must drain first. Not safe while a producer
    /// or consumer pass is in flight.
    pub fn resize(&self, new_capacity: usize) -> Result<(), RingError> {
        assert!(new_capacity >= 2, "ring capacity must be at least 2");

        let mut cursors = self.cursors.lock();
        let used = cursors.used();
        if used > 0 {
            error!(used, "resize requested with data still buffered");
            return Err(RingError::ResizePending { used });
        }

        // SAFETY: used == 0 under the lock and the caller guarantees no
        // uncommitted pass is running, so nothing references the storage.
        unsafe {
            *self.storage.get() = vec![0u8; new_capacity].into_boxed_slice();
        }
        cursors.rpos = 0;
        cursors.wpos = 0;
        cursors.capacity = new_capacity;
        self.cap.store(new_capacity, Ordering::Relaxed);
        Ok(())
    }
}
