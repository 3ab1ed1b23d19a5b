//! Threaded recording writer

use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byte_ring::ByteRing;
use parking_lot::Condvar;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::storage::{retry_write, FileStorage, StorageDev, WriteStatus};
use crate::WriterError;

/// Writer tuning parameters.
///
/// The low-water mark and per-pass cap are drain-scheduling heuristics, not
/// correctness invariants; both can be changed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Ring buffer capacity in bytes (default: 2 MiB)
    pub buffer_size: usize,
    /// Low-water mark below which the disk thread waits for more data
    /// instead of issuing a small write (default: buffer_size / 32)
    pub min_write_size: usize,
    /// Per-pass write cap, as a divisor of the buffer size (default: 4,
    /// i.e. at most a quarter of the buffer per pass)
    pub max_write_divisor: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer_size: byte_ring::DEFAULT_CAPACITY,
            min_write_size: byte_ring::DEFAULT_CAPACITY / 32,
            max_write_divisor: 4,
        }
    }
}

struct Shared<S: StorageDev> {
    dev: S,
    ring: ByteRing,

    /// Producer-visible refusal, set before the final flush so `write()`
    /// returns short counts instead of queueing more data
    no_writes: AtomicBool,
    /// A flush is pending: the disk thread ignores the low-water mark
    flushing: AtomicBool,
    /// Shutdown token, checked at every worker iteration boundary
    shutdown: AtomicBool,
    /// The device ran out of room: keep draining but discard the bytes
    ignore_writes: AtomicBool,

    /// Bytes drained since the disk thread started; gates the low-water
    /// mark and the sync cadence until it crosses `min_write_size`
    written: AtomicU64,
    /// Logical file write position in bytes
    file_pos: AtomicU64,
    /// Runtime-tunable low-water mark
    min_write_size: AtomicUsize,
    /// Per-pass write cap, recomputed when the buffer is resized
    max_write_size: AtomicUsize,
    max_write_divisor: usize,

    /// Signaled when the producer enqueues data
    has_data: Condvar,
    /// Signaled when the disk thread frees buffer space
    wrote_data: Condvar,
    /// Signaled when the buffer fully drains
    buffer_empty: Condvar,
    /// Timer wait for the sync thread
    sync_tick: Condvar,
}

/// Buffered, double-threaded file writer.
///
/// `write()` copies into the ring buffer and never performs disk I/O; the
/// disk thread drains the ring with size-bounded retrying writes and the
/// sync thread periodically makes the written range durable. Dropping the
/// writer stops accepting data, flushes what is buffered, and joins both
/// threads.
pub struct RecordingWriter<S: StorageDev = FileStorage> {
    shared: Arc<Shared<S>>,
    disk_thread: Option<JoinHandle<()>>,
    sync_thread: Option<JoinHandle<()>>,
}

impl RecordingWriter<FileStorage> {
    /// Open `path` for writing (created, truncated) and start the disk and
    /// sync threads.
    pub fn create<P: AsRef<Path>>(path: P, config: WriterConfig) -> Result<Self, WriterError> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| WriterError::Open {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = %path.display(), "recording file opened");
        Self::with_storage(FileStorage::new(file), config)
    }
}

impl<S: StorageDev> RecordingWriter<S> {
    /// Start a writer over an already-open storage device
    pub fn with_storage(dev: S, config: WriterConfig) -> Result<Self, WriterError> {
        let divisor = config.max_write_divisor.max(1);
        let shared = Arc::new(Shared {
            dev,
            ring: ByteRing::new(config.buffer_size),
            no_writes: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            ignore_writes: AtomicBool::new(false),
            written: AtomicU64::new(0),
            file_pos: AtomicU64::new(0),
            min_write_size: AtomicUsize::new(config.min_write_size),
            max_write_size: AtomicUsize::new((config.buffer_size / divisor).max(1)),
            max_write_divisor: divisor,
            has_data: Condvar::new(),
            wrote_data: Condvar::new(),
            buffer_empty: Condvar::new(),
            sync_tick: Condvar::new(),
        });

        let disk_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rec-disk".into())
                .spawn(move || shared.disk_loop())
                .map_err(WriterError::Thread)?
        };
        let sync_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rec-sync".into())
                .spawn(move || shared.sync_loop())
                .map_err(WriterError::Thread)?
        };

        debug!(
            buffer_size = config.buffer_size,
            min_write_size = config.min_write_size,
            "recording writer started"
        );
        Ok(Self {
            shared,
            disk_thread: Some(disk_thread),
            sync_thread: Some(sync_thread),
        })
    }

    /// Append `data` to the write buffer, blocking only while the buffer
    /// is full.
    ///
    /// Returns the number of bytes accepted. This equals `data.len()`
    /// unless the writer has stopped accepting data (shutdown in progress),
    /// in which case the remainder is dropped and a short count comes back.
    /// Never performs disk I/O.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let usable = self.shared.ring.capacity() - 1;
        if data.len() > usable {
            warn!(
                len = data.len(),
                usable, "write larger than the buffer, will block across passes"
            );
        }

        let mut accepted = 0;
        while accepted < data.len() {
            let remaining = &data[accepted..];
            let mut stalled = false;

            let (wpos, bytes) = {
                let mut cursors = self.shared.ring.lock();
                while cursors.free() == 0 && !self.shared.no_writes.load(Ordering::Acquire) {
                    if !stalled {
                        warn!(
                            remaining = remaining.len(),
                            capacity = cursors.capacity(),
                            "producer stalled: buffer full"
                        );
                        stalled = true;
                    }
                    self.shared
                        .wrote_data
                        .wait_for(&mut cursors, Duration::from_secs(1));
                }
                (cursors.write_pos(), remaining.len().min(cursors.free()))
            };

            if stalled {
                warn!("producer stall ended");
            }

            if self.shared.no_writes.load(Ordering::Acquire) {
                return accepted;
            }

            self.shared.ring.copy_in(wpos, &remaining[..bytes]);

            // A failed commit means a second producer raced us. The
            // accounting stays valid; the colliding bytes are lost and the
            // contract violation has been logged by the ring.
            let _ = self.shared.ring.commit_write(wpos, bytes);

            self.shared.has_data.notify_all();
            accepted += bytes;
        }

        accepted
    }

    /// Reposition the file write cursor.
    ///
    /// Seeks are assumed rare: the call drains the buffer first so the
    /// cursor moves between, not inside, buffered spans.
    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.flush();
        self.shared.dev.seek(pos)
    }

    /// Block until every buffered byte has been handed to the OS.
    ///
    /// The disk thread ignores the low-water mark while a flush is pending,
    /// so short tails go out immediately.
    pub fn flush(&self) {
        self.shared.flushing.store(true, Ordering::Release);

        let mut cursors = self.shared.ring.lock();
        while cursors.used() > 0 {
            self.shared.has_data.notify_all();
            let timed_out = self
                .shared
                .buffer_empty
                .wait_for(&mut cursors, Duration::from_secs(2))
                .timed_out();
            if timed_out {
                warn!(used = cursors.used(), "taking a long time to flush");
            }
        }
        drop(cursors);

        self.shared.flushing.store(false, Ordering::Release);
    }

    /// Force a durable sync now (the sync thread also runs this on a timer)
    pub fn sync(&self) {
        self.shared.sync_to_storage();
    }

    /// Replace the ring buffer with one of `new_size` bytes.
    ///
    /// Flushes first; buffered data is never silently discarded. Not safe
    /// while another thread is mid-`write()`. Zero is ignored.
    pub fn set_write_buffer_size(&self, new_size: usize) -> Result<(), WriterError> {
        if new_size == 0 {
            return Ok(());
        }

        self.flush();
        self.shared.ring.resize(new_size)?;
        self.shared.max_write_size.store(
            (new_size / self.shared.max_write_divisor).max(1),
            Ordering::Relaxed,
        );
        debug!(new_size, "write buffer resized");
        Ok(())
    }

    /// Set the minimum number of bytes the disk thread writes in one pass.
    /// Ignored during a flush. Zero is ignored.
    pub fn set_min_write_size(&self, new_min: usize) {
        if new_min == 0 {
            return;
        }
        self.shared.min_write_size.store(new_min, Ordering::Relaxed);
    }

    /// Bytes drained from the buffer so far (handed to the OS, unless the
    /// writer has entered discard mode after running out of room)
    pub fn bytes_written(&self) -> u64 {
        self.shared.file_pos.load(Ordering::Relaxed)
    }

    /// Bytes currently queued for the disk thread
    pub fn buffered(&self) -> usize {
        self.shared.ring.used()
    }
}

impl<S: StorageDev> Drop for RecordingWriter<S> {
    fn drop(&mut self) {
        self.shared.no_writes.store(true, Ordering::Release);
        self.flush();
        self.shared.shutdown.store(true, Ordering::Release);

        self.shared.sync_tick.notify_all();
        if let Some(handle) = self.sync_thread.take() {
            let _ = handle.join();
        }

        self.shared.has_data.notify_all();
        if let Some(handle) = self.disk_thread.take() {
            let _ = handle.join();
        }

        debug!(
            bytes = self.shared.file_pos.load(Ordering::Relaxed),
            "recording writer closed"
        );
    }
}

impl<S: StorageDev> Shared<S> {
    /// Consumer loop: drain the ring to the device until shutdown is
    /// requested and the buffer is empty.
    fn disk_loop(&self) {
        self.written.store(0, Ordering::Relaxed);

        loop {
            let shutdown = self.shutdown.load(Ordering::Acquire);
            if shutdown && self.ring.used() == 0 {
                break;
            }

            let (rpos, size) = {
                let mut cursors = self.ring.lock();
                let size = cursors.used();

                if size == 0 {
                    self.buffer_empty.notify_all();
                }

                let min_write = self.min_write_size.load(Ordering::Relaxed);
                let below_mark = size < min_write
                    && self.written.load(Ordering::Relaxed) >= min_write as u64;
                if size == 0
                    || (!shutdown && !self.flushing.load(Ordering::Acquire) && below_mark)
                {
                    self.has_data
                        .wait_for(&mut cursors, Duration::from_millis(100));
                    continue;
                }

                (cursors.read_pos(), size)
            };

            // Cap the pass so one slow write cannot hold the whole buffer
            // hostage while the producer needs the space back.
            let size = size.min(self.max_write_size.load(Ordering::Relaxed));

            let (advanced, status) = if self.ignore_writes.load(Ordering::Relaxed) {
                (size, WriteStatus::Complete)
            } else {
                let (first, second) = self.ring.read_segments(rpos, size);
                let (mut n, mut status) = retry_write(&self.dev, first);
                if status == WriteStatus::Complete && !second.is_empty() {
                    let (n2, s2) = retry_write(&self.dev, second);
                    n += n2;
                    status = s2;
                }
                (n, status)
            };

            if status == WriteStatus::NoSpace {
                error!(
                    file_pos = self.file_pos.load(Ordering::Relaxed),
                    "device out of room; dropping all further writes for this file"
                );
                self.ignore_writes.store(true, Ordering::Release);
            }

            // The low-water gate only applies once a full minimum write of
            // data has gone out, so startup trickles are not held back.
            let min_write = self.min_write_size.load(Ordering::Relaxed) as u64;
            if self.written.load(Ordering::Relaxed) <= min_write {
                self.written.fetch_add(advanced as u64, Ordering::Relaxed);
            }

            if advanced > 0 {
                // A failed commit means a second consumer raced us; the
                // ring has logged the contract violation.
                let _ = self.ring.commit_read(rpos, advanced);
                self.file_pos.fetch_add(advanced as u64, Ordering::Relaxed);
            }

            self.wrote_data.notify_all();
        }

        debug!("disk thread exiting");
    }

    /// Sync loop: make the written range durable on a timer that is
    /// independent of the write path.
    fn sync_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            {
                let mut cursors = self.ring.lock();
                // Once real data is flowing a one-second cadence is enough;
                // before that, sync the startup trickle promptly.
                let min_write = self.min_write_size.load(Ordering::Relaxed) as u64;
                let timeout = if self.written.load(Ordering::Relaxed) > min_write {
                    Duration::from_secs(1)
                } else {
                    Duration::from_millis(100)
                };
                self.sync_tick.wait_for(&mut cursors, timeout);
            }

            self.sync_to_storage();
        }

        debug!("sync thread exiting");
    }

    /// Advise-drop, data-sync, advise-drop: bounds dirty-page pressure and
    /// makes the written range durable without stalling the write path.
    /// Cheap when there is nothing new to sync.
    fn sync_to_storage(&self) {
        self.dev.drop_cache();
        if let Err(e) = self.dev.sync_data() {
            warn!("data sync failed: {e}");
        }
        self.dev.drop_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    /// In-memory device with an optional byte limit, after which writes
    /// fail with ENOSPC.
    #[derive(Clone, Default)]
    struct MemStorage {
        data: Arc<Mutex<Vec<u8>>>,
        limit: Option<usize>,
    }

    impl MemStorage {
        fn new() -> Self {
            Self::default()
        }

        fn with_limit(limit: usize) -> Self {
            Self {
                data: Arc::default(),
                limit: Some(limit),
            }
        }

        fn contents(&self) -> Vec<u8> {
            self.data.lock().clone()
        }
    }

    impl StorageDev for MemStorage {
        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            let mut data = self.data.lock();
            if let Some(limit) = self.limit {
                let room = limit.saturating_sub(data.len());
                if room == 0 {
                    #[cfg(unix)]
                    return Err(io::Error::from_raw_os_error(libc::ENOSPC));
                    #[cfg(not(unix))]
                    return Err(io::Error::new(io::ErrorKind::Other, "no space"));
                }
                let n = buf.len().min(room);
                data.extend_from_slice(&buf[..n]);
                return Ok(n);
            }
            data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn sync_data(&self) -> io::Result<()> {
            Ok(())
        }

        fn drop_cache(&self) {}

        fn seek(&self, _pos: SeekFrom) -> io::Result<u64> {
            Ok(self.data.lock().len() as u64)
        }
    }

    fn small_config() -> WriterConfig {
        WriterConfig {
            buffer_size: 1024,
            min_write_size: 32,
            max_write_divisor: 4,
        }
    }

    #[test]
    fn test_round_trip_in_order() {
        let dev = MemStorage::new();
        let writer = RecordingWriter::with_storage(dev.clone(), small_config()).unwrap();

        let mut expected = Vec::new();
        for i in 0..20u8 {
            let chunk = vec![i; 50];
            assert_eq!(writer.write(&chunk), 50);
            expected.extend_from_slice(&chunk);
        }

        writer.flush();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(dev.contents(), expected);
        assert_eq!(writer.bytes_written(), expected.len() as u64);
    }

    #[test]
    fn test_write_larger_than_buffer_completes() {
        // 4000 bytes into a 1024-byte ring: the disk thread drains at most
        // 256 bytes per pass, so the write must block across several passes
        // and still come out byte-exact.
        let dev = MemStorage::new();
        let writer = RecordingWriter::with_storage(dev.clone(), small_config()).unwrap();

        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(writer.write(&data), 4000);

        writer.flush();
        assert_eq!(dev.contents(), data);
    }

    #[test]
    fn test_flush_drains_completely() {
        let dev = MemStorage::new();
        let writer = RecordingWriter::with_storage(dev.clone(), small_config()).unwrap();

        writer.write(&[42u8; 10]); // below the low-water mark
        writer.flush();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(dev.contents(), vec![42u8; 10]);
    }

    #[test]
    fn test_drop_drains_buffered_data() {
        let dev = MemStorage::new();
        {
            let writer = RecordingWriter::with_storage(dev.clone(), small_config()).unwrap();
            writer.write(b"tail bytes");
        }
        assert_eq!(dev.contents(), b"tail bytes");
    }

    #[test]
    fn test_disk_full_never_blocks_producer() {
        let dev = MemStorage::with_limit(512);
        let writer = RecordingWriter::with_storage(dev.clone(), small_config()).unwrap();

        // Far more data than the device can hold. Every write must return
        // promptly and in full; the writer drains and discards once full.
        let start = Instant::now();
        for _ in 0..40 {
            assert_eq!(writer.write(&[7u8; 100]), 100);
        }
        writer.flush();
        assert!(
            start.elapsed() < Duration::from_secs(30),
            "writes must not hang on a full device"
        );

        assert!(dev.contents().len() <= 512);
        // The prefix that did reach the device is still in order.
        assert!(dev.contents().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_short_count_after_shutdown() {
        let dev = MemStorage::new();
        let writer = RecordingWriter::with_storage(dev, small_config()).unwrap();

        writer.shared.no_writes.store(true, Ordering::Release);
        assert_eq!(writer.write(&[1u8; 64]), 0);
    }

    #[test]
    fn test_resize_after_flush() {
        let dev = MemStorage::new();
        let writer = RecordingWriter::with_storage(dev.clone(), small_config()).unwrap();

        writer.write(&[5u8; 200]);
        writer.set_write_buffer_size(4096).unwrap();
        assert_eq!(writer.shared.ring.capacity(), 4096);
        assert_eq!(
            writer.shared.max_write_size.load(Ordering::Relaxed),
            1024
        );

        writer.write(&[6u8; 300]);
        writer.flush();
        let mut expected = vec![5u8; 200];
        expected.extend_from_slice(&[6u8; 300]);
        assert_eq!(dev.contents(), expected);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let dev = MemStorage::new();
        let writer = RecordingWriter::with_storage(dev, small_config()).unwrap();
        assert_eq!(writer.write(&[]), 0);
    }
}
