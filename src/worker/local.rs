//! Worker-local storage.
//!
//! A slot is registered once for the whole pool and gets one lazily built
//! instance per worker. Instances never leave their worker: they are built
//! on first access from that worker's thread and destroyed on it, either by
//! a `DeleteLocal` broadcast or when the worker exits.
//!
//! ```text
//!   register_slot(init, destroy) ──> SlotKey<T>
//!                                        │
//!        worker 0: ctx.local(key) ──> init() on first use, then &mut T
//!        worker 1: ctx.local(key) ──> its own T
//!                                        │
//!   delete_slot(key) ──broadcast──> each worker: destroy(T) on its thread
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// Untyped slot identifier.
pub type SlotId = u64;

/// Typed handle to a worker-local slot.
pub struct SlotKey<T> {
    id: SlotId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotKey<T> {
    pub fn id(&self) -> SlotId {
        self.id
    }
}

impl<T> Clone for SlotKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotKey<T> {}

impl<T> fmt::Debug for SlotKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotKey({})", self.id)
    }
}

type InitFn = Box<dyn Fn() -> Box<dyn Any> + Send + Sync>;
type DestroyFn = Box<dyn Fn(Box<dyn Any>) + Send + Sync>;

struct SlotSpec {
    init: InitFn,
    destroy: DestroyFn,
}

/// Slot definitions shared by every worker of a pool.
#[derive(Default)]
pub struct SlotRegistry {
    next: AtomicU64,
    slots: RwLock<HashMap<SlotId, Arc<SlotSpec>>>,
}

impl fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("slots", &self.len())
            .finish()
    }
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, I, D>(&self, init: I, destroy: D) -> SlotKey<T>
    where
        T: 'static,
        I: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let spec = SlotSpec {
            init: Box::new(move || Box::new(init()) as Box<dyn Any>),
            destroy: Box::new(move |value: Box<dyn Any>| {
                if let Ok(value) = value.downcast::<T>() {
                    destroy(*value);
                }
            }),
        };
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(spec));
        SlotKey {
            id,
            _marker: PhantomData,
        }
    }

    /// Removes the definition; workers can no longer build new instances.
    pub fn unregister(&self, id: SlotId) -> bool {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn is_registered(&self, id: SlotId) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spec(&self, id: SlotId) -> Option<Arc<SlotSpec>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

/// The instances owned by one worker.
pub struct LocalStorage {
    registry: Arc<SlotRegistry>,
    values: HashMap<SlotId, (Arc<SlotSpec>, Box<dyn Any>)>,
}

impl fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorage")
            .field("instances", &self.values.len())
            .finish()
    }
}

impl LocalStorage {
    pub fn new(registry: Arc<SlotRegistry>) -> Self {
        Self {
            registry,
            values: HashMap::new(),
        }
    }

    /// This worker's instance, built on first access.
    ///
    /// `None` once the slot has been deleted.
    pub fn get<T: 'static>(&mut self, key: SlotKey<T>) -> Option<&mut T> {
        if !self.values.contains_key(&key.id) {
            let spec = self.registry.spec(key.id)?;
            let value = (spec.init)();
            trace!(slot = key.id, "Worker-local instance created");
            self.values.insert(key.id, (spec, value));
        }
        self.values
            .get_mut(&key.id)
            .and_then(|(_, value)| value.downcast_mut::<T>())
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.values.contains_key(&id)
    }

    /// Destroys this worker's instance, if it was ever built.
    pub fn delete(&mut self, id: SlotId) -> bool {
        match self.values.remove(&id) {
            Some((spec, value)) => {
                (spec.destroy)(value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Drop for LocalStorage {
    fn drop(&mut self) {
        for (_, (spec, value)) in self.values.drain() {
            (spec.destroy)(value);
        }
    }
}
