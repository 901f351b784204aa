//! Typed annotation slots for program objects.
//!
//! Every CFG object (block, edge, graph, workspace) carries a [`PropList`]:
//! a table of typed attributes keyed by [`PropId`] descriptors. Analyses
//! communicate exclusively through these slots; an identifier pins both the
//! attribute name and its value type, so a mismatched read is a compile
//! error rather than a runtime cast failure.

use ahash::AHashMap;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_KEY: AtomicU32 = AtomicU32::new(0);

/// Identifier of one annotation slot. The phantom parameter fixes the value
/// type stored under this identifier.
pub struct PropId<T> {
    key: u32,
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T: 'static> PropId<T> {
    /// Allocate a fresh identifier. Identifiers are created once per
    /// pipeline context and threaded through the passes that share them.
    pub fn new(name: &'static str) -> Self {
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            name,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for PropId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PropId<T> {}

impl<T> std::fmt::Debug for PropId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PropId({}#{})", self.name, self.key)
    }
}

/// Property list: the attribute table hanging off a program object.
/// Attach and remove are O(1).
#[derive(Default)]
pub struct PropList {
    slots: AHashMap<u32, Box<dyn Any>>,
}

impl PropList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the attribute stored under `id`, if any.
    pub fn get<T: 'static>(&self, id: PropId<T>) -> Option<&T> {
        self.slots.get(&id.key).and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self, id: PropId<T>) -> Option<&mut T> {
        self.slots.get_mut(&id.key).and_then(|b| b.downcast_mut())
    }

    /// Attach `value` under `id`, replacing any previous attribute.
    pub fn set<T: 'static>(&mut self, id: PropId<T>, value: T) {
        self.slots.insert(id.key, Box::new(value));
    }

    /// Detach and return the attribute stored under `id`.
    pub fn remove<T: 'static>(&mut self, id: PropId<T>) -> Option<T> {
        self.slots
            .remove(&id.key)
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn has<T: 'static>(&self, id: PropId<T>) -> bool {
        self.slots.contains_key(&id.key)
    }

    /// Read a copyable attribute with a fallback default.
    pub fn get_or<T: Copy + 'static>(&self, id: PropId<T>, default: T) -> T {
        self.get(id).copied().unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl std::fmt::Debug for PropList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PropList({} slots)", self.slots.len())
    }
}
