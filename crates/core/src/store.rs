//! Thread-safe scoped key/value store attached to every context
//!
//! A [`ScopedStore`] maps string keys to opaque, shareable values. Every mutating
//! operation takes the write half of a single reader/writer lock and every read
//! takes the read half; guards are dropped at the end of each call, so no lock is
//! ever held across user code. `parking_lot`'s lock is eventually fair, so neither
//! readers nor writers can be starved indefinitely.
//!
//! Values that implement [`Releasable`] (stored through
//! [`ScopedStore::put_releasable`]) are released when the store is cleared. The
//! store itself is safe for concurrent access; values placed in it are shared by
//! reference and synchronizing their interior state is up to the caller.

use crate::collector::run_guarded;
use crate::errors::StoreError;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Capability for values that own a resource which must be released explicitly
pub trait Releasable: Send + Sync {
    /// Release the resource
    fn release(&self) -> anyhow::Result<()>;
}

/// An opaque value held by a store
#[derive(Clone)]
pub struct StoreValue {
    value: Arc<dyn Any + Send + Sync>,
    releasable: Option<Arc<dyn Releasable>>,
}

impl StoreValue {
    fn plain<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            releasable: None,
        }
    }

    fn releasable<T: Releasable + Any>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            value: value.clone(),
            releasable: Some(value),
        }
    }

    /// Downcast to a concrete type
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Whether the value is of type `T`
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Whether the value exposes the releasable capability
    pub fn is_releasable(&self) -> bool {
        self.releasable.is_some()
    }

    /// Release the underlying resource, if the value is releasable
    pub fn release(&self) -> anyhow::Result<()> {
        match &self.releasable {
            Some(releasable) => releasable.release(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StoreValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreValue")
            .field("releasable", &self.is_releasable())
            .finish_non_exhaustive()
    }
}

/// Thread-safe ordered key/value container
#[derive(Default)]
pub struct ScopedStore {
    entries: RwLock<IndexMap<String, StoreValue>>,
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidArgument {
            message: "key is empty".to_string(),
        });
    }
    Ok(())
}

fn typed<T: Any + Send + Sync>(key: &str, value: &StoreValue) -> Result<Arc<T>, StoreError> {
    value.downcast::<T>().ok_or_else(|| StoreError::TypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
    })
}

impl ScopedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value for the key
    pub fn put<T: Any + Send + Sync>(
        &self,
        key: &str,
        value: T,
    ) -> Result<Option<StoreValue>, StoreError> {
        check_key(key)?;
        Ok(self
            .entries
            .write()
            .insert(key.to_string(), StoreValue::plain(value)))
    }

    /// Insert a releasable value, returning the previous value for the key
    ///
    /// The value is released when the store is cleared.
    pub fn put_releasable<T: Releasable + Any>(
        &self,
        key: &str,
        value: T,
    ) -> Result<Option<StoreValue>, StoreError> {
        check_key(key)?;
        Ok(self
            .entries
            .write()
            .insert(key.to_string(), StoreValue::releasable(value)))
    }

    /// Get a typed value
    ///
    /// `Ok(None)` means the key is absent. A present value of another type is a
    /// [`StoreError::TypeMismatch`].
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Option<Arc<T>>, StoreError> {
        check_key(key)?;
        let entries = self.entries.read();
        entries.get(key).map(|value| typed::<T>(key, value)).transpose()
    }

    /// Get the untyped value for a key
    pub fn get_value(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        check_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    /// Get a typed value, or `default` when the key is absent (the default is not stored)
    pub fn get_or_default<T: Any + Send + Sync>(
        &self,
        key: &str,
        default: T,
    ) -> Result<Arc<T>, StoreError> {
        Ok(self.get::<T>(key)?.unwrap_or_else(|| Arc::new(default)))
    }

    /// Get a typed value, inserting the result of `f` when the key is absent
    ///
    /// `f` runs under the write lock and must not touch this store.
    pub fn compute_if_absent<T, F>(&self, key: &str, f: F) -> Result<Arc<T>, StoreError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        check_key(key)?;
        let mut entries = self.entries.write();
        let value = entries
            .entry(key.to_string())
            .or_insert_with(|| StoreValue::plain(f()));
        typed::<T>(key, value)
    }

    /// Remove a value without releasing it; ownership passes to the caller
    pub fn remove(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        check_key(key)?;
        Ok(self.entries.write().shift_remove(key))
    }

    /// Whether a value is stored under the key
    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        check_key(key)?;
        Ok(self.entries.read().contains_key(key))
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the keys in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Copy every entry of `other` into this store, replacing existing keys
    ///
    /// Values are shared, not cloned. Merging a store into itself is a no-op.
    pub fn merge(&self, other: &ScopedStore) -> &Self {
        if std::ptr::eq(self, other) {
            return self;
        }
        let snapshot: Vec<(String, StoreValue)> = other
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !snapshot.is_empty() {
            self.entries.write().extend(snapshot);
        }
        self
    }

    /// Create an independent store holding the same (shared) values
    pub fn duplicate(&self) -> ScopedStore {
        ScopedStore {
            entries: RwLock::new(self.entries.read().clone()),
        }
    }

    /// Release every releasable value, then empty the store
    ///
    /// Every value is attempted even if an earlier release fails or panics;
    /// failures are logged and never returned. Returns the number of failed releases.
    pub fn clear(&self) -> usize {
        let drained: Vec<(String, StoreValue)> = self.entries.write().drain(..).collect();
        let mut failures = 0;
        for (key, value) in drained {
            if !value.is_releasable() {
                continue;
            }
            trace!("releasing store value [{}]", key);
            if let Err(e) = run_guarded(|| value.release()) {
                failures += 1;
                warn!("Failed to release store value [{}]: {:#}", key, e);
            }
        }
        failures
    }
}

impl fmt::Debug for ScopedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStore")
            .field("keys", &self.keys())
            .finish()
    }
}
