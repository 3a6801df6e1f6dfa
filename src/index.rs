//! Key index contract and the default concurrent implementation.
//!
//! The engine only needs four CAS-shaped operations plus enumeration for
//! GC and scans; anything satisfying [`KeyIndex`] can be plugged in. The
//! bundled [`HashIndex`] is a fixed-capacity open-addressing table of
//! atomic `{key, value}` slots: claims go through a CAS on the key cell,
//! erases leave a tombstone by clearing the value, so reinserted keys
//! reuse their slot.

use std::hash::{BuildHasher, BuildHasherDefault};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rustc_hash::FxHasher;

use crate::error::{Result, StoreError};
use crate::record::RecordPtr;

/// Concurrent map from key to record handle.
pub trait KeyIndex: Send + Sync {
    fn get(&self, key: u64) -> Option<RecordPtr>;
    /// `Ok(false)` on duplicate; errors only when the index is out of
    /// capacity.
    fn insert(&self, key: u64, ptr: RecordPtr) -> Result<bool>;
    /// CAS the stored handle.
    fn update(&self, key: u64, expected: RecordPtr, new: RecordPtr) -> bool;
    /// CAS-remove the mapping.
    fn erase(&self, key: u64, expected: RecordPtr) -> bool;
    /// Point-in-time enumeration, sorted by key.
    fn entries(&self) -> Vec<(u64, RecordPtr)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Slot {
    /// `key + 1`; 0 means the slot was never claimed. A claimed slot stays
    /// claimed by its key; erasure only clears the value.
    key: AtomicU64,
    value: AtomicU64,
}

/// Fixed-capacity open-addressing hash table. Keys are limited to
/// `u64::MAX - 1` by the empty-slot sentinel.
pub struct HashIndex {
    slots: Box<[Slot]>,
    mask: usize,
    len: AtomicUsize,
}

impl HashIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| Slot {
                key: AtomicU64::new(0),
                value: AtomicU64::new(0),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            len: AtomicUsize::new(0),
        }
    }

    fn start_slot(&self, key: u64) -> usize {
        let hasher = BuildHasherDefault::<FxHasher>::default();
        hasher.hash_one(key) as usize & self.mask
    }

    /// Walks the probe sequence until the key's slot or an unclaimed slot
    /// appears.
    fn find(&self, key: u64) -> Option<&Slot> {
        let tagged = key + 1;
        let start = self.start_slot(key);
        for i in 0..=self.mask {
            let slot = &self.slots[(start + i) & self.mask];
            match slot.key.load(Ordering::Acquire) {
                0 => return None,
                k if k == tagged => return Some(slot),
                _ => {}
            }
        }
        None
    }
}

impl KeyIndex for HashIndex {
    fn get(&self, key: u64) -> Option<RecordPtr> {
        let slot = self.find(key)?;
        match slot.value.load(Ordering::Acquire) {
            0 => None,
            value => Some(RecordPtr(value)),
        }
    }

    fn insert(&self, key: u64, ptr: RecordPtr) -> Result<bool> {
        debug_assert!(!ptr.is_null());
        let tagged = key + 1;
        let start = self.start_slot(key);
        for i in 0..=self.mask {
            let slot = &self.slots[(start + i) & self.mask];
            let mut current = slot.key.load(Ordering::Acquire);
            if current == 0 {
                match slot
                    .key
                    .compare_exchange(0, tagged, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => current = tagged,
                    Err(actual) => current = actual,
                }
            }
            if current == tagged {
                return Ok(
                    if slot
                        .value
                        .compare_exchange(0, ptr.0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.len.fetch_add(1, Ordering::Relaxed);
                        true
                    } else {
                        false
                    },
                );
            }
        }
        Err(StoreError::IndexFull)
    }

    fn update(&self, key: u64, expected: RecordPtr, new: RecordPtr) -> bool {
        debug_assert!(!new.is_null());
        match self.find(key) {
            Some(slot) => slot
                .value
                .compare_exchange(expected.0, new.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    fn erase(&self, key: u64, expected: RecordPtr) -> bool {
        match self.find(key) {
            Some(slot) => {
                if slot
                    .value
                    .compare_exchange(expected.0, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn entries(&self) -> Vec<(u64, RecordPtr)> {
        let mut out = Vec::with_capacity(self.len());
        for slot in self.slots.iter() {
            let key = slot.key.load(Ordering::Acquire);
            if key == 0 {
                continue;
            }
            let value = slot.value.load(Ordering::Acquire);
            if value != 0 {
                out.push((key - 1, RecordPtr(value)));
            }
        }
        out.sort_unstable_by_key(|(key, _)| *key);
        out
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}
