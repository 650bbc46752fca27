//! The counter array: one slot per worker thread plus one for the producer's
//! control thread.
//!
//! The producer allocates the array before `fork`, so the child's copy lives at
//! the same virtual address as the observer's (untouched) copy. The observer
//! never reads its own copy; it only uses the addresses, through [`RemoteLayout`],
//! to peek the child's memory.

use memoffset::offset_of;
use nix::unistd::Pid;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VirtualAddress {
    address: usize,
}

impl VirtualAddress {
    pub fn new(address: usize) -> Self {
        Self { address }
    }

    pub fn addr(&self) -> usize {
        self.address
    }

    pub fn offset(&self, bytes: usize) -> Self {
        Self {
            address: self.address + bytes,
        }
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

/// One counter, plus the TID of the thread that owns (writes) it.
///
/// Both fields are a single machine word so that one `PTRACE_PEEKDATA` reads
/// each of them.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Slot {
    owner: AtomicUsize,
    count: AtomicUsize,
}

impl Slot {
    /// Record the calling thread as this slot's writer.
    pub fn register(&self, tid: Pid) {
        self.owner.store(tid.as_raw() as usize, Ordering::Release);
    }

    pub fn owner(&self) -> Option<Pid> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Pid::from_raw(raw as i32)),
        }
    }

    /// Bump the count. Only the owning thread calls this, so a plain
    /// load/store pair is enough.
    #[inline]
    pub fn increment(&self) {
        let v = self.count.load(Ordering::Relaxed);
        self.count.store(v.wrapping_add(1), Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct CounterArray {
    slots: Box<[Slot]>,
}

impl CounterArray {
    /// Allocate `workers + 1` zeroed slots; the last one belongs to the control thread.
    pub fn new(workers: usize) -> Self {
        let slots = (0..=workers).map(|_| Slot::default()).collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn workers(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn worker_slot(&self, idx: usize) -> &Slot {
        &self.slots[..self.workers()][idx]
    }

    pub fn control_slot(&self) -> &Slot {
        &self.slots[self.workers()]
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn remote_layout(&self) -> RemoteLayout {
        RemoteLayout {
            base: VirtualAddress::new(self.slots.as_ptr() as usize),
            len: self.slots.len(),
        }
    }
}

/// Where the counter slots live in the producer's address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RemoteLayout {
    base: VirtualAddress,
    len: usize,
}

impl RemoteLayout {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_address(&self, idx: usize) -> VirtualAddress {
        assert!(idx < self.len, "slot {idx} out of bounds {}", self.len);
        self.base.offset(idx * size_of::<Slot>())
    }

    pub fn owner_address(&self, idx: usize) -> VirtualAddress {
        self.slot_address(idx).offset(offset_of!(Slot, owner))
    }

    pub fn count_address(&self, idx: usize) -> VirtualAddress {
        self.slot_address(idx).offset(offset_of!(Slot, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_slot_is_last() {
        let counters = CounterArray::new(3);
        assert_eq!(counters.len(), 4);
        assert_eq!(counters.workers(), 3);

        counters.control_slot().increment();
        counters.control_slot().increment();
        assert_eq!(counters.slots()[3].count(), 2);
        assert_eq!(counters.worker_slot(0).count(), 0);
    }

    #[test]
    fn owner_is_unset_until_registered() {
        let slot = Slot::default();
        assert_eq!(slot.owner(), None);
        slot.register(Pid::from_raw(4242));
        assert_eq!(slot.owner(), Some(Pid::from_raw(4242)));
    }

    #[test]
    fn layout_addresses_point_at_local_fields() {
        let counters = CounterArray::new(2);
        let layout = counters.remote_layout();
        assert_eq!(layout.len(), 3);

        for (idx, slot) in counters.slots().iter().enumerate() {
            assert_eq!(
                layout.count_address(idx).addr(),
                &slot.count as *const AtomicUsize as usize
            );
            assert_eq!(
                layout.owner_address(idx).addr(),
                &slot.owner as *const AtomicUsize as usize
            );
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn layout_rejects_out_of_range_slot() {
        CounterArray::new(1).remote_layout().count_address(2);
    }
}
