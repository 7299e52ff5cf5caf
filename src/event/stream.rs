/*!
 * Lock-Free Event Stream
 *
 * Double-buffered many-writers single-reader event stream. Posting threads
 * append into the active write block; the draining thread swaps blocks and
 * iterates the retired one. The only coordination is the `write` block
 * index: a negative sentinel value in it excludes every other operation,
 * replacing a mutex for the short, rarely contended critical section.
 */

use super::record::{record_size, EventHeader, EventIter};
use crate::core::limits::{EVENT_HEADER_LEN, EVENT_SENTINEL_ROOM, MIN_BLOCK_CAPACITY};
use crate::core::sync::{SpinConfig, SpinWait};
use crate::core::types::Handle;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// `write` holds this while a poster owns the active block
const BLOCK_POSTING: i32 = -1;
/// `write` holds this while the drain routine swaps blocks
const BLOCK_SWAPPING: i32 = -2;

/// Notification sink fired on the first post into each posting epoch
///
/// Lets a draining thread sleep on its own primitive instead of polling;
/// the stream itself never blocks.
pub trait Wakeup: Send + Sync {
    fn notify(&self);
}

/// One of the two alternating event buffers
struct EventBlock {
    data: Vec<u8>,
    used: usize,
    fired: bool,
}

impl EventBlock {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(MIN_BLOCK_CAPACITY)],
            used: 0,
            fired: false,
        }
    }

    /// Grow (never shrink) so a record of `total` bytes plus the terminator
    /// fits. Returns true if the buffer was reallocated.
    fn ensure_room(&mut self, total: usize) -> bool {
        let needed = self.used + total + EVENT_SENTINEL_ROOM;
        if needed <= self.data.len() {
            return false;
        }
        // Roughly double, plus the needed increment
        let grown = (self.data.len() * 2).max(needed);
        self.data.resize(grown, 0);
        true
    }

    /// Append one record at `used` and re-terminate the list
    fn append(&mut self, header: EventHeader, payload: &[u8]) {
        let size = header.size as usize;
        let start = self.used;
        header.write_to(&mut self.data[start..]);

        let body = start + EVENT_HEADER_LEN;
        self.data[body..body + payload.len()].copy_from_slice(payload);
        self.data[body + payload.len()..start + size].fill(0);

        self.used = start + size;
        // Zero-`system` sentinel immediately past the new used mark, not
        // counted in `used`
        self.data[self.used..self.used + EVENT_SENTINEL_ROOM].fill(0);
    }

    fn reset(&mut self) {
        self.used = 0;
        self.fired = false;
    }
}

/// Event stream statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamStats {
    pub posts: u64,
    pub drains: u64,
    pub grows: u64,
}

/// Lock-free double-buffered event stream
///
/// # Thread Safety
///
/// `post` is safe from any number of threads and spin-yields while another
/// poster or the drain routine holds the write block. `process` is
/// single-reader by contract; the contract is runtime-enforced and its
/// violation is a fatal assertion, not a recoverable error.
///
/// # Ordering
///
/// Serials are stamped under the posting exclusivity, so storage order
/// inside a block matches serial order across all posting threads. Posts
/// arriving after a `process` call land in the new write block and are
/// invisible until the next one.
pub struct EventStream {
    /// Active write block index: 0, 1, or a negative transient sentinel
    write: AtomicI32,
    /// Read block index, touched only under the swapping sentinel
    read: AtomicUsize,
    blocks: [UnsafeCell<EventBlock>; 2],
    /// Per-stream serial counter; low 16 bits are stamped on records
    serial: AtomicU32,
    /// A drained block is outstanding
    draining: AtomicBool,
    spin: SpinConfig,
    wakeup: ArcSwapOption<Box<dyn Wakeup>>,
    posts: AtomicU64,
    drains: AtomicU64,
    grows: AtomicU64,
}

// SAFETY: the blocks inside UnsafeCell are accessed exclusively under the
// write-word sentinel protocol (posters, swap) or the draining guard
// (iteration of the read block), never concurrently.
unsafe impl Sync for EventStream {}

impl EventStream {
    /// Create a stream with both blocks pre-sized to `initial_capacity`
    /// bytes (minimum 256) and the default spin policy
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_spin(initial_capacity, SpinConfig::default())
    }

    /// Create a stream with an explicit spin policy
    pub fn with_spin(initial_capacity: usize, spin: SpinConfig) -> Self {
        Self {
            write: AtomicI32::new(0),
            read: AtomicUsize::new(1),
            blocks: [
                UnsafeCell::new(EventBlock::with_capacity(initial_capacity)),
                UnsafeCell::new(EventBlock::with_capacity(initial_capacity)),
            ],
            serial: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            spin,
            wakeup: ArcSwapOption::const_empty(),
            posts: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            grows: AtomicU64::new(0),
        }
    }

    /// Acquire exclusive access to the active write block
    ///
    /// Any negative `write` value means another poster or the drain routine
    /// holds it; back off and retry.
    #[inline]
    fn acquire_write(&self, sentinel: i32) -> i32 {
        let mut spin = SpinWait::new(self.spin);
        loop {
            let current = self.write.load(Ordering::Acquire);
            if current >= 0
                && self
                    .write
                    .compare_exchange(current, sentinel, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return current;
            }
            spin.spin();
        }
    }

    /// Release exclusivity, restoring `index` into `write`
    ///
    /// The CAS must succeed: failure means another thread stole or replaced
    /// the sentinel, a reentrancy bug that cannot be recovered from.
    #[inline]
    fn release_write(&self, sentinel: i32, index: i32) {
        self.write
            .compare_exchange(sentinel, index, Ordering::AcqRel, Ordering::Acquire)
            .expect("event stream exclusivity sentinel clobbered");
    }

    /// Post an event from any thread
    ///
    /// `system` must be non-zero (zero marks end-of-block); a zero system is
    /// a debug assertion and a release-mode no-op. The block grows on demand
    /// and never shrinks; growth failure aborts (the structure has no
    /// fallback path by design).
    pub fn post(&self, system: u8, id: u8, object: Handle, payload: &[u8]) {
        debug_assert!(system != 0, "events must have non-zero system");
        if system == 0 {
            return;
        }

        let total = record_size(payload.len());
        let current = self.acquire_write(BLOCK_POSTING);

        // Serial stamped inside the critical section: storage order in the
        // block matches serial order
        let serial = (self.serial.fetch_add(1, Ordering::Relaxed) & 0xFFFF) as u16;
        let header = EventHeader {
            system,
            id,
            serial,
            size: total as u32,
            object,
        };

        // SAFETY: the posting sentinel grants this thread sole access to
        // the write block; the reader only ever touches the other block.
        let block = unsafe { &mut *self.blocks[current as usize].get() };
        if block.ensure_room(total) {
            self.grows.fetch_add(1, Ordering::Relaxed);
        }
        block.append(header, payload);

        if !block.fired {
            if let Some(sink) = self.wakeup.load_full() {
                sink.notify();
                block.fired = true;
            }
        }

        self.posts.fetch_add(1, Ordering::Relaxed);
        self.release_write(BLOCK_POSTING, current);
    }

    /// Swap blocks and return the retired write block for iteration
    ///
    /// Single-reader only: a second `process` while a [`DrainedBlock`] is
    /// alive is a fatal contract violation. Posters back off during the
    /// swap exactly as they do for a competing poster.
    pub fn process(&self) -> DrainedBlock<'_> {
        let last_write = self.acquire_write(BLOCK_SWAPPING);
        assert!(
            !self.draining.swap(true, Ordering::AcqRel),
            "event stream processed while a drained block is still alive"
        );

        let read = self.read.load(Ordering::Relaxed);
        // SAFETY: the swapping sentinel excludes posters, and the draining
        // guard just taken excludes any other reader.
        unsafe { (*self.blocks[read].get()).reset() };

        self.read.store(last_write as usize, Ordering::Relaxed);
        self.drains.fetch_add(1, Ordering::Relaxed);
        self.release_write(BLOCK_SWAPPING, read as i32);

        DrainedBlock {
            stream: self,
            index: last_write as usize,
        }
    }

    /// Install a wakeup sink, replacing any previous one
    ///
    /// If events are already pending in the active block the sink fires
    /// immediately, so a drainer installing late cannot miss the epoch.
    pub fn set_wakeup(&self, sink: Box<dyn Wakeup>) {
        self.wakeup.store(Some(Arc::new(sink)));

        let current = self.acquire_write(BLOCK_POSTING);
        // SAFETY: posting sentinel held, see `post`.
        let block = unsafe { &mut *self.blocks[current as usize].get() };
        if block.used > 0 && !block.fired {
            if let Some(sink) = self.wakeup.load_full() {
                sink.notify();
                block.fired = true;
            }
        }
        self.release_write(BLOCK_POSTING, current);
    }

    /// Remove the wakeup sink
    pub fn clear_wakeup(&self) {
        self.wakeup.store(None);
    }

    /// Snapshot statistics
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            posts: self.posts.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            grows: self.grows.load(Ordering::Relaxed),
        }
    }
}

/// A retired event block handed out by [`EventStream::process`]
///
/// Holds the read side of the stream; dropping it permits the next
/// `process` call. Iteration is restartable and finite.
pub struct DrainedBlock<'a> {
    stream: &'a EventStream,
    index: usize,
}

impl DrainedBlock<'_> {
    /// Iterate the drained records in storage (= serial) order
    pub fn events(&self) -> EventIter<'_> {
        // SAFETY: the draining guard keeps this block untouched until drop;
        // posters only write the other block.
        let block = unsafe { &*self.stream.blocks[self.index].get() };
        EventIter::new(&block.data[..block.used])
    }

    /// Bytes of record data in the block
    pub fn used_bytes(&self) -> usize {
        // SAFETY: see `events`.
        unsafe { (*self.stream.blocks[self.index].get()).used }
    }

    pub fn is_empty(&self) -> bool {
        self.used_bytes() == 0
    }
}

impl Drop for DrainedBlock<'_> {
    fn drop(&mut self) {
        self.stream.draining.store(false, Ordering::Release);
    }
}
