//! Handle table mapping opaque promise handles to records.
//!
//! Records live in a slot vector with a free list of reclaimed slots. A
//! handle packs the slot index together with that slot's generation. A slot's
//! generation moves forward every time its record is removed, and a slot
//! whose generations are used up is retired instead of reused, so an
//! `(index, generation)` pair is never handed out twice by a table.
//!
//! [`HandleTable::recycle`] empties a table while keeping its generations,
//! which is how handles of a previous engine instance stay stale.
//!
//! The table does not decide when a record dies; reference counting lives
//! in the engine, which calls [`HandleTable::remove`].

use std::fmt;
use std::num::NonZeroUsize;

use crate::value::Value;

/// Bits of a handle holding the slot index (plus one).
const INDEX_BITS: u32 = if usize::BITS >= 64 { 32 } else { 20 };

/// Mask selecting the index part.
const INDEX_MASK: usize = (1usize << INDEX_BITS) - 1;

/// Largest generation a slot can carry.
const MAX_GENERATION: usize = usize::MAX >> INDEX_BITS;

/// Opaque identifier of a promise record.
///
/// Never zero, so the null word is free to mean "no promise" at the C
/// boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(NonZeroUsize);

impl PromiseId {
    fn new(index: usize, generation: usize) -> Option<Self> {
        let low = index.checked_add(1).filter(|low| *low <= INDEX_MASK)?;
        if generation > MAX_GENERATION {
            return None;
        }
        NonZeroUsize::new((generation << INDEX_BITS) | low).map(PromiseId)
    }

    /// Rebuild an id from its raw word. Returns `None` for words that can
    /// never be a handle (zero, or an empty index part).
    pub fn from_raw(raw: usize) -> Option<Self> {
        if raw & INDEX_MASK == 0 {
            return None;
        }
        NonZeroUsize::new(raw).map(PromiseId)
    }

    /// The raw word.
    pub fn as_raw(self) -> usize {
        self.0.get()
    }

    /// Carry the handle in a value slot.
    pub fn to_value(self) -> Value {
        Value::from_usize(self.as_raw())
    }

    /// Interpret a value slot as a handle.
    pub fn from_value(value: Value) -> Option<Self> {
        Self::from_raw(value.as_usize())
    }

    fn index(self) -> usize {
        (self.0.get() & INDEX_MASK) - 1
    }

    fn generation(self) -> usize {
        self.0.get() >> INDEX_BITS
    }
}

impl fmt::Debug for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromiseId({}:{})", self.index(), self.generation())
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise({}:{})", self.index(), self.generation())
    }
}

enum Slot<T> {
    Occupied { value: T, generation: usize },
    /// `generation` is what the next occupant gets.
    Vacant { next_free: Option<usize>, generation: usize },
    /// Every generation of this slot has been handed out.
    Retired,
}

/// Slot table with free-list reuse.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
    max_generation: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_head: None,
            len: 0,
            max_generation: MAX_GENERATION,
        }
    }

    /// Reserve room for at least `additional` more slots.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a record and hand out its id.
    ///
    /// Running out of handle space is not recoverable: the process aborts.
    pub fn insert(&mut self, value: T) -> PromiseId {
        let (index, generation, next_free) = match self.free_head {
            Some(free) => match self.slots[free] {
                Slot::Vacant {
                    next_free,
                    generation,
                } => (free, generation, next_free),
                _ => unreachable!("free list pointed to a used slot"),
            },
            None => (self.slots.len(), 0, None),
        };

        let Some(id) = PromiseId::new(index, generation) else {
            tracing::error!(index, live = self.len, "promise handle space exhausted");
            std::process::abort();
        };

        let slot = Slot::Occupied { value, generation };
        if index == self.slots.len() {
            self.slots.push(slot);
        } else {
            self.slots[index] = slot;
            self.free_head = next_free;
        }

        self.len += 1;
        id
    }

    pub fn get(&self, id: PromiseId) -> Option<&T> {
        match self.slots.get(id.index())? {
            Slot::Occupied { value, generation } if *generation == id.generation() => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: PromiseId) -> Option<&mut T> {
        match self.slots.get_mut(id.index())? {
            Slot::Occupied { value, generation } if *generation == id.generation() => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: PromiseId) -> bool {
        self.get(id).is_some()
    }

    /// Take a record out of the table and free its slot.
    pub fn remove(&mut self, id: PromiseId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        let value = self.vacate(id.index())?;
        self.len -= 1;
        Some(value)
    }

    /// Remove every record, keeping slot generations so that no id handed
    /// out before is valid afterwards. Returns the removed records.
    pub fn recycle(&mut self) -> Vec<T> {
        let occupied: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Occupied { .. }))
            .map(|(index, _)| index)
            .collect();
        let values = occupied
            .into_iter()
            .filter_map(|index| self.vacate(index))
            .collect();
        self.len = 0;
        values
    }

    /// Turn an occupied slot into a vacant (or retired) one.
    fn vacate(&mut self, index: usize) -> Option<T> {
        let Slot::Occupied { generation, .. } = self.slots[index] else {
            return None;
        };
        let replacement = if generation < self.max_generation {
            Slot::Vacant {
                next_free: self.free_head,
                generation: generation + 1,
            }
        } else {
            tracing::debug!(index, "handle slot retired");
            Slot::Retired
        };
        let reusable = matches!(replacement, Slot::Vacant { .. });

        let Slot::Occupied { value, .. } = std::mem::replace(&mut self.slots[index], replacement)
        else {
            return None;
        };
        if reusable {
            self.free_head = Some(index);
        }
        Some(value)
    }

    /// Ids of every live record, in slot order.
    pub fn ids(&self) -> impl Iterator<Item = PromiseId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, .. } => PromiseId::new(index, *generation),
                _ => None,
            })
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
