//! Address-range index behind unified (UVA) pointers.
//!
//! The process-wide index maps host-visible ranges and native handles back to the [`Memory`]
//! that owns them so kernels can be called with plain pointers. Entries hold weak references;
//! only allocations made through `Device::uva_alloc` are pinned here until `uva_free`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock, Weak};

use crate::memory::{Memory, MemoryInner};

#[derive(Default)]
pub(crate) struct AddressRangeIndex {
    ranges: BTreeMap<usize, RangeEntry>,
    points: HashMap<usize, Weak<MemoryInner>>,
}

struct RangeEntry {
    end: usize,
    memory: Weak<MemoryInner>,
}

impl AddressRangeIndex {
    /// Registers `[start, start + len)`. Empty ranges match their start address only.
    pub(crate) fn insert_range(&mut self, start: usize, len: usize, memory: Weak<MemoryInner>) {
        if len == 0 {
            self.insert_point(start, memory);
            return;
        }
        self.ranges.insert(
            start,
            RangeEntry {
                end: start + len,
                memory,
            },
        );
    }

    pub(crate) fn insert_point(&mut self, addr: usize, memory: Weak<MemoryInner>) {
        self.points.insert(addr, memory);
    }

    /// Removes the range at `start` if it still belongs to `owner`.
    pub(crate) fn remove_range(&mut self, start: usize, len: usize, owner: *const MemoryInner) {
        if len == 0 {
            self.remove_point(start, owner);
            return;
        }
        if self
            .ranges
            .get(&start)
            .is_some_and(|entry| Weak::as_ptr(&entry.memory) == owner)
        {
            self.ranges.remove(&start);
        }
    }

    pub(crate) fn remove_point(&mut self, addr: usize, owner: *const MemoryInner) {
        if self
            .points
            .get(&addr)
            .is_some_and(|memory| Weak::as_ptr(memory) == owner)
        {
            self.points.remove(&addr);
        }
    }

    /// Owner of `addr` and the byte offset of `addr` inside it.
    pub(crate) fn lookup(&self, addr: usize) -> Option<(Weak<MemoryInner>, usize)> {
        if let Some(memory) = self.points.get(&addr) {
            return Some((memory.clone(), 0));
        }
        let (start, entry) = self.ranges.range(..=addr).next_back()?;
        (addr < entry.end).then(|| (entry.memory.clone(), addr - start))
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len() + self.points.len()
    }
}

#[derive(Default)]
pub(crate) struct GlobalIndex {
    pub(crate) index: AddressRangeIndex,
    pinned: HashMap<usize, Memory>,
}

static GLOBAL_INDEX: OnceLock<Mutex<GlobalIndex>> = OnceLock::new();

pub(crate) fn with_global<R>(f: impl FnOnce(&mut GlobalIndex) -> R) -> R {
    let mut guard = GLOBAL_INDEX
        .get_or_init(|| Mutex::new(GlobalIndex::default()))
        .lock()
        .expect("uva index poisoned");
    f(&mut guard)
}

/// Resolves `addr` to its owning memory and the offset inside it.
pub(crate) fn resolve(addr: usize) -> Option<(Memory, usize)> {
    let (weak, offset) = with_global(|global| global.index.lookup(addr))?;
    let inner = weak.upgrade()?;
    Some((Memory::from_inner(inner), offset))
}

pub(crate) fn pin(addr: usize, memory: Memory) {
    // A replaced pin is dropped after the lock is released.
    let replaced = with_global(|global| global.pinned.insert(addr, memory));
    drop(replaced);
}

pub(crate) fn unpin(addr: usize) -> Option<Memory> {
    with_global(|global| global.pinned.remove(&addr))
}

/// Removes and returns every pinned memory matching `predicate`.
pub(crate) fn unpin_where(predicate: impl Fn(&Memory) -> bool) -> Vec<Memory> {
    with_global(|global| {
        let keys: Vec<usize> = global
            .pinned
            .iter()
            .filter(|(_, memory)| predicate(memory))
            .map(|(addr, _)| *addr)
            .collect();
        keys.into_iter()
            .filter_map(|addr| global.pinned.remove(&addr))
            .collect()
    })
}
