//! Generation-checked handle registries.
//!
//! Components and ports are owned by the [`System`](crate::system::System)
//! and referred to elsewhere by [`Handle`]s. A handle stores the slot index
//! together with the generation of the slot at insertion time, so a handle to
//! a removed object never resolves to an object inserted later in the same
//! slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use slab::Slab;

use crate::error::{Error, ErrorCode};

/// A typed, generation-checked reference to an object of a [`Registry`].
pub struct Handle<T> {
    index: usize,
    generation: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Returns the slot index of the handle.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Entry<T> {
    generation: u64,
    value: T,
}

/// A store of objects addressed by [`Handle`]s.
pub struct Registry<T> {
    entries: Slab<Entry<T>>,
    next_generation: u64,
}

impl<T> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            next_generation: 0,
        }
    }

    /// Inserts an object and returns its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.entries.insert(Entry { generation, value });

        Handle {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Returns the object referred to by the handle, if it is still live.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.entries
            .get(handle.index)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &e.value)
    }

    /// Returns a mutable reference to the object referred to by the handle,
    /// if it is still live.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &mut e.value)
    }

    /// Resolves a handle, failing with `E_INVALID_HANDLE`.
    pub fn resolve(&self, handle: Handle<T>) -> Result<&T, Error> {
        self.get(handle).ok_or_else(|| invalid_handle(handle))
    }

    /// Mutably resolves a handle, failing with `E_INVALID_HANDLE`.
    pub fn resolve_mut(&mut self, handle: Handle<T>) -> Result<&mut T, Error> {
        self.get_mut(handle).ok_or_else(|| invalid_handle(handle))
    }

    /// Removes the object referred to by the handle.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        self.get(handle)?;

        Some(self.entries.remove(handle.index).value)
    }

    /// Returns the number of live objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the registry holds no object.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the live objects and their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.entries.iter().map(|(index, e)| {
            (
                Handle {
                    index,
                    generation: e.generation,
                    _marker: PhantomData,
                },
                &e.value,
            )
        })
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Registry ({} entries)", self.entries.len())
    }
}

fn invalid_handle<T>(handle: Handle<T>) -> Error {
    Error::new(
        ErrorCode::InvalidHandle,
        format!("handle {:?} does not refer to a live object", handle),
    )
}
