//! Storage for long-lived records that are referenced from many threads
//! by small copyable handles.
//!
//! Slots are reused after deallocation, but every reuse bumps the slot
//! generation, so a stale handle never resolves to the new occupant.

use parking_lot::RwLock;
use std::{fmt, hash, marker::PhantomData, num::NonZeroU32, sync::Arc};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct Address {
    index: u32,
    generation: NonZeroU32,
}

pub struct Handle<T>(Address, PhantomData<fn() -> T>);
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for Handle<T> {}
impl<T> hash::Hash for Handle<T> {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.0.hash(hasher);
    }
}
impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handle({}v{})", self.0.index, self.0.generation)
    }
}

impl<T> Handle<T> {
    pub fn index(&self) -> u32 {
        self.0.index
    }
}

struct Slot<T> {
    generation: NonZeroU32,
    value: Option<Arc<T>>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
}

pub struct Arena<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                free_list: Vec::new(),
            }),
        }
    }

    pub fn alloc(&self, value: T) -> Handle<T> {
        let mut inner = self.inner.write();
        let value = Some(Arc::new(value));
        let address = match inner.free_list.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.value = value;
                Address {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: NonZeroU32::MIN,
                    value,
                });
                Address {
                    index,
                    generation: NonZeroU32::MIN,
                }
            }
        };
        Handle(address, PhantomData)
    }

    /// Returns `None` if the handle was freed, even if its slot got reused.
    pub fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let inner = self.inner.read();
        inner
            .slots
            .get(handle.0.index as usize)
            .filter(|slot| slot.generation == handle.0.generation)
            .and_then(|slot| slot.value.clone())
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn free(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get_mut(handle.0.index as usize)
            .filter(|slot| slot.generation == handle.0.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
        inner.free_list.push(handle.0.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.slots.len() - inner.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each(&self, mut fun: impl FnMut(Handle<T>, &T)) {
        let inner = self.inner.read();
        for (index, slot) in inner.slots.iter().enumerate() {
            if let Some(ref value) = slot.value {
                let address = Address {
                    index: index as u32,
                    generation: slot.generation,
                };
                fun(Handle(address, PhantomData), value);
            }
        }
    }

    /// Free every live record, handing it to `fun`.
    pub fn dealloc_each(&self, mut fun: impl FnMut(Handle<T>, Arc<T>)) {
        let mut inner = self.inner.write();
        let Inner {
            ref mut slots,
            ref mut free_list,
        } = *inner;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                let address = Address {
                    index: index as u32,
                    generation: slot.generation,
                };
                slot.generation = slot.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
                free_list.push(index as u32);
                fun(Handle(address, PhantomData), value);
            }
        }
    }
}

#[test]
fn test_single_thread() {
    let arena = Arena::<usize>::new();
    let a = arena.alloc(3);
    let b = arena.alloc(4);
    assert_eq!(arena.get(a).as_deref(), Some(&3));
    assert_eq!(arena.get(b).as_deref(), Some(&4));
    assert_eq!(arena.len(), 2);
}

#[test]
fn stale_handle_misses_reused_slot() {
    let arena = Arena::<&str>::new();
    let first = arena.alloc("first");
    assert_eq!(arena.free(first).as_deref(), Some(&"first"));
    let second = arena.alloc("second");
    assert_eq!(first.index(), second.index());
    assert!(arena.get(first).is_none());
    assert!(arena.free(first).is_none());
    assert_eq!(arena.get(second).as_deref(), Some(&"second"));
}

#[test]
fn dealloc_each_empties() {
    let arena = Arena::<u32>::new();
    for i in 0..5 {
        arena.alloc(i);
    }
    let mut sum = 0;
    arena.dealloc_each(|_, value| sum += *value);
    assert_eq!(sum, 10);
    assert!(arena.is_empty());
}
