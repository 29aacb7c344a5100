//! Bipartite, single-writer/multi-reader byte ring buffer.
//!
//! A ring buffer of capacity `C` presents a contiguous `2C`-byte region
//! where `buf[i] == buf[i + C]` for every `i < C`; this lets a producer
//! or consumer always receive one contiguous slice for any run of up to
//! `C - 1` bytes starting anywhere, with no wraparound splitting at the
//! call site. Two backings provide this:
//!
//! - [`Backing::Mapped`]: a `C`-byte anonymous shared file mapped twice,
//!   back to back, so the two halves are literally the same physical
//!   pages (Unix only).
//! - [`Backing::Copied`]: a plain `2C`-byte allocation with the wrapped
//!   region mirrored by hand on every commit.
//!
//! Blocking is condvar-based rather than lock-free/spin, because this
//! buffer must support bounded waits across more than one reader.

use std::io;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::time::{Duration, Instant};

#[cfg(not(loom))]
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[cfg(loom)]
use loom::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::BufferError;

/// Upper bound on concurrent readers of a single ring buffer, reached
/// when an output port's value is aliased to several leaf inputs
/// through a composite's input-fan-out.
pub const MAX_READERS: usize = 16;

/// Recommended default capacity (8 MiB), per the engine's resource
/// policy: one fixed capacity per graph.
pub const DEFAULT_CAPACITY: usize = 8 * 1024 * 1024;

fn distance(from: usize, to: usize, capacity: usize) -> usize {
    (to + capacity - from) % capacity
}

enum BackingKind {
    #[cfg(unix)]
    Mapped { _file: std::fs::File },
    Copied { _storage: Box<[u8]> },
}

struct Backing {
    ptr: *mut u8,
    /// Total mapped/allocated length, `2 * capacity`.
    len: usize,
    kind: BackingKind,
}

// SAFETY: `ptr` addresses either an mmap'd region or a boxed slice that
// outlives every `Backing`; all access to the bytes it points to is
// serialized through `Inner::state`'s mutex, so sharing the raw
// pointer across threads is sound as long as callers respect that
// protocol (which only `Writer`/`Reader` do).
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn copied(capacity: usize) -> Self {
        let mut storage = vec![0u8; 2 * capacity].into_boxed_slice();
        let ptr = storage.as_mut_ptr();
        Backing { ptr, len: 2 * capacity, kind: BackingKind::Copied { _storage: storage } }
    }

    #[cfg(unix)]
    fn mapped(capacity: usize) -> io::Result<Self> {
        let file = tempfile::tempfile()?;
        file.set_len(capacity as u64)?;
        let fd = file.as_raw_fd();

        unsafe {
            let reservation = libc::mmap(
                ptr::null_mut(),
                2 * capacity,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if reservation == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            let first = libc::mmap(
                reservation,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            );
            if first == libc::MAP_FAILED {
                libc::munmap(reservation, 2 * capacity);
                return Err(io::Error::last_os_error());
            }

            let second_addr = (reservation as *mut u8).add(capacity) as *mut libc::c_void;
            let second = libc::mmap(
                second_addr,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            );
            if second == libc::MAP_FAILED {
                libc::munmap(reservation, 2 * capacity);
                return Err(io::Error::last_os_error());
            }

            Ok(Backing { ptr: reservation as *mut u8, len: 2 * capacity, kind: BackingKind::Mapped { _file: file } })
        }
    }

    /// # Safety
    /// `offset + len <= 2 * capacity` must hold, and the caller must
    /// hold exclusive or shared access per the reader/writer
    /// synchronization protocol in [`Inner`].
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }

    /// # Safety
    /// Same preconditions as [`Backing::slice_mut`].
    unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// After a write of `n` bytes starting at `start` (`start < capacity`),
    /// restore `buf[i] == buf[i + capacity]` for the touched range. A
    /// no-op for `Mapped`, whose two halves are the same physical pages.
    fn mirror(&self, capacity: usize, start: usize, n: usize) {
        let BackingKind::Copied { .. } = self.kind else { return };
        if n == 0 {
            return;
        }
        unsafe {
            if start + n <= capacity {
                ptr::copy_nonoverlapping(self.ptr.add(start), self.ptr.add(start + capacity), n);
            } else {
                let head = capacity - start;
                ptr::copy_nonoverlapping(self.ptr.add(start), self.ptr.add(start + capacity), head);
                let tail = n - head;
                ptr::copy_nonoverlapping(self.ptr.add(capacity), self.ptr, tail);
            }
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let BackingKind::Mapped { .. } = self.kind {
            // SAFETY: `ptr` was reserved with a matching `mmap` of this
            // same length; nothing else holds a view over it once the
            // owning `Inner` is being dropped.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

struct ReaderState {
    read_idx: usize,
    closed: bool,
}

struct State {
    write_idx: usize,
    write_closed: bool,
    readers: Vec<ReaderState>,
}

struct Inner {
    backing: Backing,
    capacity: usize,
    state: Mutex<State>,
    read_available: Condvar,
    write_available: Condvar,
}

impl Inner {
    fn writer_available(&self, state: &State) -> usize {
        let max_backlog = state
            .readers
            .iter()
            .filter(|r| !r.closed)
            .map(|r| distance(r.read_idx, state.write_idx, self.capacity))
            .max()
            .unwrap_or_else(|| distance(0, state.write_idx, self.capacity));
        self.capacity - 1 - max_backlog
    }

    fn reader_available(&self, state: &State, id: usize) -> usize {
        distance(state.readers[id].read_idx, state.write_idx, self.capacity)
    }

    fn all_readers_closed(&self, state: &State) -> bool {
        !state.readers.is_empty() && state.readers.iter().all(|r| r.closed)
    }
}

fn park<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> Result<MutexGuard<'a, T>, BufferError> {
    match deadline {
        None => Ok(condvar.wait(guard).unwrap()),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(BufferError::Timeout);
            }
            let (guard, _) = condvar.wait_timeout(guard, deadline - now).unwrap();
            Ok(guard)
        }
    }
}

/// A lightweight handle that can only close a writer, independent of
/// the `Writer` itself. Lets a graph owner request a graceful drain
/// (`stop` on a source block) from outside the thread that owns the
/// block's [`Writer`] — e.g. after it has been moved into a runner's
/// worker thread.
#[derive(Clone)]
pub struct WriterCloser {
    inner: Arc<Inner>,
}

impl WriterCloser {
    pub fn close(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        guard.write_closed = true;
        drop(guard);
        self.inner.read_available.notify_all();
    }
}

/// The single writer side of a ring buffer.
pub struct Writer {
    inner: Arc<Inner>,
}

impl Writer {
    /// A handle that can close this writer from another thread without
    /// otherwise needing access to it.
    pub fn closer(&self) -> WriterCloser {
        WriterCloser { inner: Arc::clone(&self.inner) }
    }

    /// Blocks until at least `min` bytes of write space are available,
    /// or fails with [`BufferError::BrokenStream`] once every reader has
    /// closed, or [`BufferError::Timeout`] past `timeout`.
    pub fn wait_available(&self, min: usize, timeout: Option<Duration>) -> Result<usize, BufferError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            let available = self.inner.writer_available(&guard);
            if available >= min {
                return Ok(available);
            }
            if self.inner.all_readers_closed(&guard) {
                return Err(BufferError::BrokenStream);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(BufferError::Timeout);
            }
            guard = park(&self.inner.write_available, guard, deadline)?;
        }
    }

    /// The current contiguous write slice, of length `writer_available`.
    pub fn buffer(&mut self) -> &mut [u8] {
        let guard = self.inner.state.lock().unwrap();
        let start = guard.write_idx;
        let available = self.inner.writer_available(&guard);
        drop(guard);
        // SAFETY: `start < capacity` and `available <= capacity - 1`, so
        // `start + available < 2 * capacity`; no reader can observe
        // these bytes until `commit` advances `write_idx` under the lock.
        unsafe { self.inner.backing.slice_mut(start, available) }
    }

    /// Advances the write cursor by `n` bytes and wakes waiting readers.
    pub fn commit(&mut self, n: usize) {
        let mut guard = self.inner.state.lock().unwrap();
        let start = guard.write_idx;
        self.inner.backing.mirror(self.inner.capacity, start, n);
        guard.write_idx = (start + n) % self.inner.capacity;
        drop(guard);
        self.inner.read_available.notify_all();
    }

    /// Signals end-of-stream: no further data will be written.
    pub fn close(&mut self) {
        let mut guard = self.inner.state.lock().unwrap();
        guard.write_closed = true;
        drop(guard);
        self.inner.read_available.notify_all();
    }

    /// Non-blocking snapshot of the current write space, in bytes.
    pub fn available(&self) -> usize {
        let guard = self.inner.state.lock().unwrap();
        self.inner.writer_available(&guard)
    }

    /// Whether this writer (or its [`WriterCloser`]) has already
    /// signalled end-of-stream, whether from inside or outside the
    /// thread that owns it.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().write_closed
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

/// One reader side of a ring buffer.
pub struct Reader {
    inner: Arc<Inner>,
    id: usize,
}

impl Reader {
    /// Blocks until at least `min` bytes are available to read. Returns
    /// fewer than `min` bytes (possibly zero, surfaced as
    /// [`BufferError::EndOfStream`]) once the writer has closed and no
    /// more will ever arrive.
    pub fn wait_available(&self, min: usize, timeout: Option<Duration>) -> Result<usize, BufferError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            let available = self.inner.reader_available(&guard, self.id);
            if available >= min {
                return Ok(available);
            }
            if guard.write_closed {
                return if available == 0 { Err(BufferError::EndOfStream) } else { Ok(available) };
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(BufferError::Timeout);
            }
            guard = park(&self.inner.read_available, guard, deadline)?;
        }
    }

    /// The current contiguous read slice, of length `reader_available`.
    pub fn buffer(&self) -> &[u8] {
        let guard = self.inner.state.lock().unwrap();
        let start = guard.readers[self.id].read_idx;
        let available = self.inner.reader_available(&guard, self.id);
        drop(guard);
        // SAFETY: the writer cannot retract bytes already reflected in
        // `write_idx`, so this slice stays valid for the caller's use.
        unsafe { self.inner.backing.slice(start, available) }
    }

    /// Advances this reader's cursor by `n` bytes and wakes the writer.
    pub fn commit(&mut self, n: usize) {
        let mut guard = self.inner.state.lock().unwrap();
        let reader = &mut guard.readers[self.id];
        reader.read_idx = (reader.read_idx + n) % self.inner.capacity;
        drop(guard);
        self.inner.write_available.notify_all();
    }

    /// Signals that this reader will not consume any more data.
    pub fn close(&mut self) {
        let mut guard = self.inner.state.lock().unwrap();
        guard.readers[self.id].closed = true;
        drop(guard);
        self.inner.write_available.notify_all();
    }

    /// Non-blocking snapshot of the currently readable byte count.
    pub fn available(&self) -> usize {
        let guard = self.inner.state.lock().unwrap();
        self.inner.reader_available(&guard, self.id)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates a ring buffer of the given `capacity` (a power of two) with
/// `num_readers` readers, returning its writer and reader handles.
///
/// Tries the `Mapped` backing on Unix first, falling back to `Copied`
/// if the double `mmap` reservation fails (e.g. address space
/// exhaustion) or on non-Unix targets.
pub fn ring_buffer(capacity: usize, num_readers: usize) -> (Writer, Vec<Reader>) {
    assert!(capacity.is_power_of_two(), "ring buffer capacity must be a power of two");
    assert!(num_readers <= MAX_READERS, "num_readers {num_readers} exceeds MAX_READERS {MAX_READERS}");

    let backing = new_backing(capacity);
    let state = State {
        write_idx: 0,
        write_closed: false,
        readers: (0..num_readers).map(|_| ReaderState { read_idx: 0, closed: false }).collect(),
    };
    let inner = Arc::new(Inner {
        backing,
        capacity,
        state: Mutex::new(state),
        read_available: Condvar::new(),
        write_available: Condvar::new(),
    });

    let writer = Writer { inner: Arc::clone(&inner) };
    let readers = (0..num_readers).map(|id| Reader { inner: Arc::clone(&inner), id }).collect();
    (writer, readers)
}

#[cfg(all(unix, not(loom)))]
fn new_backing(capacity: usize) -> Backing {
    match Backing::mapped(capacity) {
        Ok(backing) => backing,
        Err(err) => {
            tracing::warn!(error = %err, "mapped ring buffer backing unavailable, falling back to copied");
            Backing::copied(capacity)
        }
    }
}

#[cfg(all(not(unix), not(loom)))]
fn new_backing(capacity: usize) -> Backing {
    Backing::copied(capacity)
}

// Under loom, model checking explores every interleaving many times
// over; skip the real `mmap`/`tempfile` syscalls entirely and always
// use the plain allocation, the same way the `Arc`/`Mutex`/`Condvar`
// imports above swap to `loom::sync` instead of exercising real OS
// scheduling.
#[cfg(loom)]
fn new_backing(capacity: usize) -> Backing {
    Backing::copied(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_reader_round_trip() {
        let (mut writer, mut readers) = ring_buffer(64, 1);
        let mut reader = readers.remove(0);

        writer.wait_available(4, None).unwrap();
        writer.buffer()[..4].copy_from_slice(&[1, 2, 3, 4]);
        writer.commit(4);

        reader.wait_available(4, None).unwrap();
        assert_eq!(reader.buffer(), &[1, 2, 3, 4]);
        reader.commit(4);
    }

    #[test]
    fn mirror_equivalence_across_wrap() {
        let capacity = 16;
        let (mut writer, mut readers) = ring_buffer(capacity, 1);
        let mut reader = readers.remove(0);

        // Fill to near the boundary, drain, then write again so the next
        // write straddles the physical wrap point.
        writer.wait_available(12, None).unwrap();
        writer.buffer()[..12].copy_from_slice(&[0xAA; 12]);
        writer.commit(12);
        reader.wait_available(12, None).unwrap();
        reader.commit(12);

        writer.wait_available(8, None).unwrap();
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        writer.buffer()[..8].copy_from_slice(&data);
        writer.commit(8);

        unsafe {
            for i in 0..capacity {
                assert_eq!(
                    *writer.inner.backing.ptr.add(i),
                    *writer.inner.backing.ptr.add(i + capacity),
                    "mirror mismatch at index {i}"
                );
            }
        }

        reader.wait_available(8, None).unwrap();
        assert_eq!(reader.buffer(), &data);
    }

    #[test]
    fn writer_observes_broken_stream_once_all_readers_close() {
        let (writer, mut readers) = ring_buffer(16, 1);
        readers.remove(0).close();
        assert_eq!(writer.wait_available(1, None).unwrap_err(), BufferError::BrokenStream);
    }

    #[test]
    fn reader_observes_end_of_stream_after_drain() {
        let (mut writer, mut readers) = ring_buffer(16, 1);
        let mut reader = readers.remove(0);
        writer.buffer()[..4].copy_from_slice(&[9; 4]);
        writer.commit(4);
        writer.close();

        reader.wait_available(4, None).unwrap();
        reader.commit(4);
        assert_eq!(reader.wait_available(1, None).unwrap_err(), BufferError::EndOfStream);
    }

    #[test]
    fn timeout_without_progress() {
        let (_writer, mut readers) = ring_buffer(16, 1);
        let reader = readers.remove(0);
        let err = reader.wait_available(1, Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err, BufferError::Timeout);
    }

    #[test]
    fn fan_out_keeps_writer_unblocked_until_every_reader_closes() {
        let (writer, mut readers) = ring_buffer(16, 2);
        let mut slow = readers.remove(1);
        let mut fast = readers.remove(0);

        {
            let mut w = writer;
            w.buffer()[..4].copy_from_slice(&[1, 2, 3, 4]);
            w.commit(4);
            fast.wait_available(4, None).unwrap();
            fast.commit(4);
            fast.close();

            // The slow reader is still open, so the writer must not see
            // BrokenStream yet even though the fast one has gone away.
            assert!(w.wait_available(1, Some(Duration::from_millis(5))).is_ok());
            slow.close();
            assert_eq!(w.wait_available(1, None).unwrap_err(), BufferError::BrokenStream);
        }
    }
}

#[cfg(loom)]
mod loom_tests {
    use loom::thread;

    use super::*;

    #[test]
    fn loom_single_reader_sees_every_committed_byte() {
        loom::model(|| {
            let (mut writer, mut readers) = ring_buffer(2, 1);
            let mut reader = readers.remove(0);

            let writer_thread = thread::spawn(move || {
                writer.wait_available(1, None).unwrap();
                writer.buffer()[0] = 7;
                writer.commit(1);
            });

            let reader_thread = thread::spawn(move || {
                reader.wait_available(1, None).unwrap();
                let byte = reader.buffer()[0];
                reader.commit(1);
                byte
            });

            writer_thread.join().unwrap();
            assert_eq!(reader_thread.join().unwrap(), 7);
        });
    }

    #[test]
    fn loom_reader_close_unblocks_writer() {
        loom::model(|| {
            let (writer, mut readers) = ring_buffer(2, 1);
            let mut reader = readers.remove(0);

            let reader_thread = thread::spawn(move || {
                reader.close();
            });

            reader_thread.join().unwrap();
            assert_eq!(writer.wait_available(1, None).unwrap_err(), BufferError::BrokenStream);
        });
    }
}
