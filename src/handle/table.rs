/*!
 * Lock-Free Handle Table
 *
 * Fixed-capacity mapping of opaque 64-bit handles to object pointers.
 * Reservation and release are concurrent and lock free: the free list is an
 * intrusive chain threaded through the slot array, popped and pushed with
 * single-word CAS on a versioned head; stale handles are rejected through a
 * per-slot generation counter embedded in the slot control word.
 */

use super::slot::{self, REF_MAX};
use crate::core::errors::HandleError;
use crate::core::limits::{
    GEN_FIELD_BITS, HEAD_INDEX_BITS, HEAD_INDEX_MASK, HEAD_VERSION_BITS, MAX_INDEX_BITS,
    MIN_TABLE_CAPACITY, NO_NEXT,
};
use crate::core::sync::{SpinConfig, SpinWait};
use crate::core::types::{Generation, Handle, HandleResult, SlotIndex};
use log::error;
use serde::{Deserialize, Serialize};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// One table entry: control word plus object pointer
///
/// The control word (see [`super::slot`]) is the only field touched by CAS;
/// the pointer is written under reservation exclusivity and read racily by
/// the unsynchronized lookup path.
struct Slot<T> {
    state: AtomicU64,
    value: AtomicPtr<T>,
}

/// Handle table statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TableStats {
    pub capacity: u32,
    pub in_use: u32,
}

/// Lock-free fixed-capacity handle table
///
/// Issues opaque handles encoding a slot index (low `size_bits` bits) and a
/// monotonically increasing generation id (the bits above). Handle 0 is
/// never issued. Capacity is fixed at construction; exhaustion is a normal,
/// recoverable condition.
///
/// # Thread Safety
///
/// `reserve`, `free`, `set`, `lookup`, `lookup_ref`, and `lookup_unref` may
/// be called concurrently from any number of threads. Coordination is a
/// single CAS word per slot plus one versioned free-list head; contended
/// operations retry under the configured [`SpinConfig`].
///
/// # Pointer Lifetime
///
/// The table stores raw pointers and never dereferences them. `lookup` is
/// the unsynchronized fast path: it can return a pointer whose object is
/// concurrently being released. Callers needing lifetime safety across a
/// race window use `lookup_ref`/`lookup_unref`.
pub struct HandleTable<T> {
    slots: Box<[Slot<T>]>,
    /// Free-list head: 14-bit version + 50-bit index of the first free slot
    free: AtomicU64,
    /// Monotonic generation counter, starts at 1 (0 is reserved invalid)
    id: AtomicU64,
    size: u32,
    size_bits: u32,
    index_mask: u64,
    id_mask: u64,
    spin: SpinConfig,
}

impl<T> HandleTable<T> {
    /// Create a table with the given slot count and default spin policy
    pub fn new(capacity: usize) -> Self {
        Self::with_spin(capacity, SpinConfig::default())
    }

    /// Create a table with an explicit spin policy
    ///
    /// Capacities below the minimum are clamped (debug builds assert).
    /// Panics if the capacity needs 50 or more index bits.
    pub fn with_spin(capacity: usize, spin: SpinConfig) -> Self {
        debug_assert!(
            capacity >= MIN_TABLE_CAPACITY,
            "handle table capacity {} below minimum {}",
            capacity,
            MIN_TABLE_CAPACITY
        );
        let capacity = capacity.max(MIN_TABLE_CAPACITY);

        // Number of bits needed to represent any index
        let size_bits = (capacity as u64).next_power_of_two().trailing_zeros();
        assert!(
            size_bits < MAX_INDEX_BITS,
            "handle table capacity {} exceeds index space",
            capacity
        );

        let id_bits = (62 - size_bits).min(GEN_FIELD_BITS);

        // Initial free list: one chain covering every slot, in index order
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|i| {
                let next = if i + 1 < capacity {
                    (i + 1) as SlotIndex
                } else {
                    NO_NEXT
                };
                Slot {
                    state: AtomicU64::new(slot::free_word(next)),
                    value: AtomicPtr::new(ptr::null_mut()),
                }
            })
            .collect();

        Self {
            slots,
            free: AtomicU64::new(0),
            id: AtomicU64::new(1),
            size: capacity as u32,
            size_bits,
            index_mask: (1 << size_bits) - 1,
            id_mask: (1 << id_bits) - 1,
            spin,
        }
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    /// Slot index encoded in a handle issued by this table
    #[inline]
    pub fn index_of(&self, handle: Handle) -> SlotIndex {
        handle.raw() & self.index_mask
    }

    /// Generation id encoded in a handle issued by this table
    #[inline]
    pub fn generation_of(&self, handle: Handle) -> Generation {
        (handle.raw() >> self.size_bits) & self.id_mask
    }

    #[inline]
    fn encode(&self, generation: Generation, index: SlotIndex) -> Handle {
        Handle((generation << self.size_bits) | index)
    }

    /// Draw the next generation id, skipping the masked value 0 on wraparound
    #[inline]
    fn next_generation(&self) -> Generation {
        loop {
            let gen = self.id.fetch_add(1, Ordering::Relaxed) & self.id_mask;
            if gen != 0 {
                return gen;
            }
        }
    }

    /// Reserve a slot and issue a new handle
    ///
    /// Pops the free-list head with a CAS retry loop. An empty free list is
    /// the recoverable exhaustion condition: logged and returned as
    /// [`HandleError::Exhausted`].
    pub fn reserve(&self) -> HandleResult<Handle> {
        let mut spin = SpinWait::new(self.spin);
        let index = loop {
            let head = self.free.load(Ordering::Acquire);
            let index = head & HEAD_INDEX_MASK;
            if index == NO_NEXT {
                error!("Handle table full, unable to reserve handle");
                return Err(HandleError::Exhausted {
                    capacity: self.size,
                });
            }

            let word = self.slots[index as usize].state.load(Ordering::Acquire);
            if !slot::is_free(word) {
                // Racing popper claimed this slot between our head load and
                // now; the head has already moved on
                spin.spin();
                continue;
            }

            let next = slot::next_index(word);
            if self
                .free
                .compare_exchange(
                    head,
                    bump_head(head, next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break index;
            }
            spin.spin();
        };

        // Slot is exclusively ours: clear to occupied/null, then publish
        let entry = &self.slots[index as usize];
        entry.value.store(ptr::null_mut(), Ordering::Relaxed);
        let generation = self.next_generation();
        entry
            .state
            .store(slot::occupied_word(generation, 0), Ordering::Release);

        Ok(self.encode(generation, index))
    }

    /// Return a slot to the free list
    ///
    /// Freeing is purely index-based: the generation id is neither validated
    /// nor reclaimed. Freeing an already-free slot is a silent no-op
    /// (returns false). Callers must not retain the handle afterward.
    pub fn free(&self, handle: Handle) -> bool {
        let index = self.index_of(handle);
        if index >= self.size as u64 {
            return false;
        }

        let entry = &self.slots[index as usize];
        if slot::is_free(entry.state.load(Ordering::Acquire)) {
            return false;
        }

        let mut spin = SpinWait::new(self.spin);
        loop {
            let head = self.free.load(Ordering::Acquire);
            entry
                .state
                .store(slot::free_word(head & HEAD_INDEX_MASK), Ordering::Release);
            if self
                .free
                .compare_exchange(
                    head,
                    bump_head(head, index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
            spin.spin();
        }
    }

    /// Store the object pointer for a freshly reserved handle
    ///
    /// Contract: the caller holds exclusive knowledge of a reserved,
    /// not-yet-set handle. A second `set` on the same handle is a
    /// programming error (debug builds assert).
    pub fn set(&self, handle: Handle, object: NonNull<T>) -> HandleResult<()> {
        let index = self.index_of(handle);
        if index >= self.size as u64 {
            return Err(HandleError::Stale(handle));
        }

        let entry = &self.slots[index as usize];
        let word = entry.state.load(Ordering::Acquire);
        if slot::is_free(word) || slot::generation(word) != self.generation_of(handle) {
            return Err(HandleError::Stale(handle));
        }

        if slot::refcount(word) != 0 || !entry.value.load(Ordering::Acquire).is_null() {
            debug_assert!(false, "double set on handle {}", handle);
            return Err(HandleError::Stale(handle));
        }

        entry.value.store(object.as_ptr(), Ordering::Release);
        // Install the base reference owned by the handle holder
        entry.state.store(
            slot::occupied_word(self.generation_of(handle), 1),
            Ordering::Release,
        );
        Ok(())
    }

    /// Unsynchronized handle-to-pointer lookup
    ///
    /// Returns `None` for freed, stale, or not-yet-set handles. This is the
    /// fast path for callers that independently guarantee object lifetime:
    /// the returned pointer may belong to an object concurrently being
    /// released on another thread.
    #[inline]
    pub fn lookup(&self, handle: Handle) -> Option<NonNull<T>> {
        let index = self.index_of(handle);
        if index >= self.size as u64 {
            return None;
        }
        let entry = &self.slots[index as usize];
        let word = entry.state.load(Ordering::Acquire);
        if slot::is_free(word) || slot::generation(word) != self.generation_of(handle) {
            return None;
        }
        NonNull::new(entry.value.load(Ordering::Acquire))
    }

    /// Raw pointer lookup by slot index, ignoring the generation
    ///
    /// Trusted internal iteration only (teardown, leak scan).
    pub fn raw_lookup(&self, index: SlotIndex) -> Option<NonNull<T>> {
        if index >= self.size as u64 {
            return None;
        }
        let entry = &self.slots[index as usize];
        if slot::is_free(entry.state.load(Ordering::Acquire)) {
            return None;
        }
        NonNull::new(entry.value.load(Ordering::Acquire))
    }

    /// Reconstruct the live handle stored at a slot index
    ///
    /// Returns [`Handle::NULL`] if the slot is free.
    pub fn raw_id(&self, index: SlotIndex) -> Handle {
        if index >= self.size as u64 {
            return Handle::NULL;
        }
        let word = self.slots[index as usize].state.load(Ordering::Acquire);
        if slot::is_free(word) {
            return Handle::NULL;
        }
        self.encode(slot::generation(word), index)
    }

    /// Safe handle-to-pointer lookup, incrementing the reference count
    ///
    /// The generation check and the refcount increment are one
    /// compare-exchange on the slot control word, so a reference is granted
    /// only if the slot still held a live matching object at the instant of
    /// the increment. Pair every successful call with `lookup_unref`.
    pub fn lookup_ref(&self, handle: Handle) -> Option<NonNull<T>> {
        let index = self.index_of(handle);
        if index >= self.size as u64 {
            return None;
        }
        let generation = self.generation_of(handle);
        let entry = &self.slots[index as usize];

        let mut word = entry.state.load(Ordering::Acquire);
        loop {
            if slot::is_free(word)
                || slot::generation(word) != generation
                || slot::refcount(word) == 0
            {
                return None;
            }
            let refs = slot::refcount(word);
            assert!(refs < REF_MAX, "handle refcount overflow on {}", handle);
            match entry.state.compare_exchange_weak(
                word,
                slot::occupied_word(generation, refs + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(entry.value.load(Ordering::Acquire)),
                Err(current) => word = current,
            }
        }
    }

    /// Release a reference taken with `lookup_ref`
    ///
    /// When the count reaches zero the object pointer is handed to the
    /// caller-supplied deallocator and the slot returns to the free list via
    /// the same path as `free`. Returns true if the handle was still live.
    pub fn lookup_unref(&self, handle: Handle, deallocate: impl FnOnce(NonNull<T>)) -> bool {
        let index = self.index_of(handle);
        if index >= self.size as u64 {
            return false;
        }
        let generation = self.generation_of(handle);
        let entry = &self.slots[index as usize];

        let mut word = entry.state.load(Ordering::Acquire);
        loop {
            if slot::is_free(word)
                || slot::generation(word) != generation
                || slot::refcount(word) == 0
            {
                return false;
            }
            let refs = slot::refcount(word);
            match entry.state.compare_exchange_weak(
                word,
                slot::occupied_word(generation, refs - 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if refs == 1 {
                        let object = entry.value.swap(ptr::null_mut(), Ordering::AcqRel);
                        if let Some(object) = NonNull::new(object) {
                            deallocate(object);
                        }
                        self.free(handle);
                    }
                    return true;
                }
                Err(current) => word = current,
            }
        }
    }

    /// Occupied slot count (linear scan, approximate under concurrency)
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| !slot::is_free(entry.state.load(Ordering::Acquire)))
            .count()
    }

    /// Snapshot statistics
    pub fn stats(&self) -> TableStats {
        TableStats {
            capacity: self.size,
            in_use: self.in_use() as u32,
        }
    }
}

impl<T> Drop for HandleTable<T> {
    fn drop(&mut self) {
        // Leak scan: occupied slots at teardown are reported, never fatal
        let leaked = self.in_use();
        if leaked > 0 {
            error!(
                "{} slot(s) still occupied or reserved in handle table at drop",
                leaked
            );
        }
    }
}

/// Advance the free-list head to `index`, bumping the ABA version
#[inline]
fn bump_head(head: u64, index: SlotIndex) -> u64 {
    let version = (head >> HEAD_INDEX_BITS).wrapping_add(1) & ((1 << HEAD_VERSION_BITS) - 1);
    (version << HEAD_INDEX_BITS) | index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak(value: u64) -> NonNull<u64> {
        NonNull::new(Box::into_raw(Box::new(value))).unwrap()
    }

    unsafe fn reclaim(ptr: NonNull<u64>) -> u64 {
        *Box::from_raw(ptr.as_ptr())
    }

    #[test]
    fn test_reserve_set_lookup_free_roundtrip() {
        let table = HandleTable::<u64>::new(8);
        let handle = table.reserve().unwrap();
        assert!(!handle.is_null());

        let object = leak(99);
        table.set(handle, object).unwrap();
        assert_eq!(table.lookup(handle), Some(object));

        assert!(table.free(handle));
        assert_eq!(table.lookup(handle), None);
        assert_eq!(unsafe { reclaim(object) }, 99);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let table = HandleTable::<u64>::new(4);
        let handles: Vec<_> = (0..4).map(|_| table.reserve().unwrap()).collect();

        // All distinct and non-zero
        for (i, a) in handles.iter().enumerate() {
            assert!(!a.is_null());
            for b in &handles[i + 1..] {
                assert_ne!(a, b);
            }
        }

        assert_eq!(
            table.reserve(),
            Err(HandleError::Exhausted { capacity: 4 })
        );

        // Freeing one slot makes reserve succeed again
        assert!(table.free(handles[1]));
        let fresh = table.reserve().unwrap();
        assert_eq!(table.index_of(fresh), table.index_of(handles[1]));
        assert_ne!(
            table.generation_of(fresh),
            table.generation_of(handles[1])
        );
    }

    #[test]
    fn test_stale_handle_lookup_misses() {
        let table = HandleTable::<u64>::new(4);
        let stale = table.reserve().unwrap();
        let object = leak(1);
        table.set(stale, object).unwrap();
        table.free(stale);

        // Reoccupy the same slot with a different logical object
        let fresh = table.reserve().unwrap();
        let replacement = leak(2);
        table.set(fresh, replacement).unwrap();
        assert_eq!(table.index_of(fresh), table.index_of(stale));

        assert_eq!(table.lookup(stale), None);
        assert_eq!(table.lookup(fresh), Some(replacement));
        assert_eq!(table.set(stale, object), Err(HandleError::Stale(stale)));

        table.free(fresh);
        unsafe {
            reclaim(object);
            reclaim(replacement);
        }
    }

    #[test]
    fn test_double_free_is_a_noop() {
        let table = HandleTable::<u64>::new(4);
        let handle = table.reserve().unwrap();
        assert!(table.free(handle));
        assert!(!table.free(handle));

        // The free list is intact: exactly capacity reserves still succeed
        let handles: Vec<_> = (0..4).map(|_| table.reserve().unwrap()).collect();
        assert!(table.reserve().is_err());
        for h in handles {
            table.free(h);
        }
    }

    #[test]
    fn test_reserved_but_unset_lookup_misses() {
        let table = HandleTable::<u64>::new(4);
        let handle = table.reserve().unwrap();
        assert_eq!(table.lookup(handle), None);
        assert_eq!(table.lookup_ref(handle), None);
        table.free(handle);
    }

    #[test]
    fn test_raw_lookup_ignores_generation() {
        let table = HandleTable::<u64>::new(4);
        let handle = table.reserve().unwrap();
        let object = leak(5);
        table.set(handle, object).unwrap();
        let index = table.index_of(handle);

        assert_eq!(table.raw_lookup(index), Some(object));
        assert_eq!(table.raw_id(index), handle);

        table.free(handle);
        assert_eq!(table.raw_lookup(index), None);
        assert_eq!(table.raw_id(index), Handle::NULL);
        unsafe { reclaim(object) };
    }

    #[test]
    fn test_lookup_ref_counts_and_deallocates() {
        let table = HandleTable::<u64>::new(4);
        let handle = table.reserve().unwrap();
        let object = leak(7);
        table.set(handle, object).unwrap();

        // Base ref from set plus one taken here
        assert_eq!(table.lookup_ref(handle), Some(object));

        let mut deallocated = 0;
        assert!(table.lookup_unref(handle, |_| deallocated += 1));
        assert_eq!(deallocated, 0);

        // Last release deallocates and frees the slot
        assert!(table.lookup_unref(handle, |ptr| {
            deallocated += 1;
            unsafe { reclaim(ptr) };
        }));
        assert_eq!(deallocated, 1);
        assert_eq!(table.lookup(handle), None);
        assert!(!table.lookup_unref(handle, |_| panic!("dead handle")));
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_stats() {
        let table = HandleTable::<u64>::new(8);
        let h = table.reserve().unwrap();
        let stats = table.stats();
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.in_use, 1);
        table.free(h);
        assert_eq!(table.stats().in_use, 0);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let table = HandleTable::<u64>::new(MIN_TABLE_CAPACITY);
        assert_eq!(table.capacity(), MIN_TABLE_CAPACITY);
    }
}
