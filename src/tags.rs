// src/tags.rs

//! Side-table that keeps user tags alive while the kernel may still echo them.
//!
//! The kernel stores a registration's `udata` word without taking part in our
//! memory management. Instead of handing it a raw `Arc` pointer, each tagged
//! registration gets a slot here holding a strong reference, and the kernel
//! only ever sees a token naming that slot. A token carries the slot's
//! generation, so a stale token (slot vacated and reused since) resolves to
//! "no tag" rather than to somebody else's tag.
//!
//! A slot is released when its registration is deleted, when a one-shot
//! result for it arrives, or when it is re-added without a tag. Re-adding
//! with a new tag moves the slot to a new generation.
//! Lookups are linear scans; registration churn is low compared to event
//! volume, so O(n) per mutation is fine.

use crate::kevent::Filter;
use log::trace;
use std::sync::Arc;

/// The "no tag" sentinel passed to the kernel.
pub const NO_TAG: usize = 0;

const INDEX_BITS: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: usize = usize::MAX >> INDEX_BITS;

struct Slot<T> {
    key: (usize, Filter),
    generation: usize,
    tag: Option<Arc<T>>,
}

/// The state of one key before a registration attempt.
pub struct Displaced<T> {
    key: (usize, Filter),
    previous: Option<(usize, usize, Arc<T>)>,
}

pub struct TagTable<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for TagTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TagTable<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Records `tag` for the registration `(ident, filter)` and returns the
    /// token to hand to the kernel.
    ///
    /// Re-adding a registration that already holds a tag replaces it and the
    /// old reference is released. Registering without a tag releases whatever
    /// the registration held before and returns [`NO_TAG`].
    pub fn hold(&mut self, ident: usize, filter: Filter, tag: Option<&Arc<T>>) -> usize {
        let key = (ident, filter);

        if let Some(index) = self.find_live(key) {
            let slot = &mut self.slots[index];
            return match tag {
                Some(tag) => {
                    // New generation: results still carrying the old token
                    // must not resolve to (or release) the new tag.
                    slot.generation = (slot.generation + 1) & GENERATION_MASK;
                    slot.tag = Some(Arc::clone(tag));
                    trace!("Replaced tag of {:?} in slot {}", key, index);
                    encode(index, slot.generation)
                }
                None => {
                    slot.tag = None;
                    trace!("Released tag of {:?} from slot {} (re-added untagged)", key, index);
                    NO_TAG
                }
            };
        }

        let Some(tag) = tag else {
            return NO_TAG;
        };

        match self.slots.iter().position(|slot| slot.tag.is_none()) {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.key = key;
                slot.generation = (slot.generation + 1) & GENERATION_MASK;
                slot.tag = Some(Arc::clone(tag));
                trace!("Reused slot {} for {:?}", index, key);
                encode(index, slot.generation)
            }
            None => {
                let index = self.slots.len();
                self.slots.push(Slot {
                    key,
                    generation: 0,
                    tag: Some(Arc::clone(tag)),
                });
                trace!("Appended slot {} for {:?}", index, key);
                encode(index, 0)
            }
        }
    }

    /// Captures what `(ident, filter)` holds now, so a registration that the
    /// kernel rejects can be rolled back with [`TagTable::restore`].
    pub fn displaced(&self, ident: usize, filter: Filter) -> Displaced<T> {
        let key = (ident, filter);
        let previous = self.find_live(key).and_then(|index| {
            let slot = &self.slots[index];
            slot.tag.clone().map(|tag| (index, slot.generation, tag))
        });
        Displaced { key, previous }
    }

    /// Undoes every `hold` for the captured key since [`TagTable::displaced`].
    ///
    /// A previously live registration gets its slot, generation and tag back;
    /// a slot the rejected registration created is released.
    pub fn restore(&mut self, displaced: Displaced<T>) {
        let Displaced { key, previous } = displaced;
        match previous {
            Some((index, generation, tag)) => {
                if let Some(slot) = self.slots.get_mut(index) {
                    slot.key = key;
                    slot.generation = generation;
                    slot.tag = Some(tag);
                    trace!("Restored tag of {:?} in slot {}", key, index);
                }
            }
            None => {
                if let Some(index) = self.find_live(key) {
                    self.slots[index].tag = None;
                    trace!("Rolled back slot {} for {:?}", index, key);
                }
            }
        }
    }

    /// Releases the tag held for `(ident, filter)`, returning it.
    pub fn release(&mut self, ident: usize, filter: Filter) -> Option<Arc<T>> {
        let index = self.find_live((ident, filter))?;
        trace!("Released slot {} for {:?}", index, (ident, filter));
        self.slots[index].tag.take()
    }

    /// Releases the slot named by a kernel token, if it is still current.
    pub fn release_token(&mut self, token: usize) -> Option<Arc<T>> {
        let index = self.current_index(token)?;
        trace!("Released slot {} by token {:#x}", index, token);
        self.slots[index].tag.take()
    }

    /// The tag a kernel token refers to, with a new strong reference for the
    /// caller.
    pub fn resolve(&self, token: usize) -> Option<Arc<T>> {
        let index = self.current_index(token)?;
        self.slots[index].tag.clone()
    }

    /// The token the kernel currently holds for `(ident, filter)`.
    pub fn current_token(&self, ident: usize, filter: Filter) -> usize {
        match self.find_live((ident, filter)) {
            Some(index) => encode(index, self.slots[index].generation),
            None => NO_TAG,
        }
    }

    /// Number of tags currently held.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.tag.is_some()).count()
    }

    /// Number of slots, live or vacated.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn find_live(&self, key: (usize, Filter)) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.tag.is_some() && slot.key == key)
    }

    fn current_index(&self, token: usize) -> Option<usize> {
        let (index, generation) = decode(token)?;
        let slot = self.slots.get(index)?;
        (slot.tag.is_some() && slot.generation == generation).then_some(index)
    }
}

fn encode(index: usize, generation: usize) -> usize {
    debug_assert!(index < INDEX_MASK);
    ((generation & GENERATION_MASK) << INDEX_BITS) | (index + 1)
}

fn decode(token: usize) -> Option<(usize, usize)> {
    let index = token & INDEX_MASK;
    if index == 0 {
        return None;
    }
    Some((index - 1, token >> INDEX_BITS))
}
