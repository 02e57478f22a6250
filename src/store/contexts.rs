//! Operation contexts
//!
//! Read-modify-write is driven by a caller-supplied context that knows how to create a
//! value from nothing, update one in place, and derive a new value from an old one.

use crate::status::Status;

/// Context for RMW (read-modify-write) operations.
pub trait RmwContext<V> {
    /// Value to store when the key is absent, deleted, or truncated.
    fn initial_value(&mut self) -> V;

    /// Modify the current value in place.
    ///
    /// Only called for fixed-size values whose record is still mutable. Returning
    /// `false` falls back to [`copy_update`](Self::copy_update).
    fn in_place_update(&mut self, value: &mut V) -> bool;

    /// Build the new value from the old one when it cannot be updated in place.
    fn copy_update(&mut self, old_value: &V) -> V
    where
        V: Clone,
    {
        let mut new_value = old_value.clone();
        self.in_place_update(&mut new_value);
        new_value
    }
}

/// RMW context built from an initial value and an update closure.
///
/// ```
/// use hybridkv::store::{RmwContext, UpdateFn};
///
/// let mut add = UpdateFn::new(5u64, |v: &mut u64| *v += 5);
/// assert_eq!(add.initial_value(), 5);
/// let mut v = 10;
/// assert!(add.in_place_update(&mut v));
/// assert_eq!(v, 15);
/// ```
pub struct UpdateFn<V, F> {
    initial: V,
    update: F,
}

impl<V, F> UpdateFn<V, F>
where
    V: Clone,
    F: FnMut(&mut V),
{
    pub fn new(initial: V, update: F) -> Self {
        Self { initial, update }
    }
}

impl<V, F> RmwContext<V> for UpdateFn<V, F>
where
    V: Clone,
    F: FnMut(&mut V),
{
    fn initial_value(&mut self) -> V {
        self.initial.clone()
    }

    fn in_place_update(&mut self, value: &mut V) -> bool {
        (self.update)(value);
        true
    }
}

/// A read that went pending and has since been resolved by `complete_pending`.
#[derive(Debug, Clone)]
pub struct CompletedRead<K, V> {
    /// Key that was read
    pub key: K,
    /// `Ok(Some)` for a value, `Ok(None)` when absent, `Err` for an I/O failure
    pub result: Result<Option<V>, Status>,
}

impl<K, V> CompletedRead<K, V> {
    /// Status the read would have returned had it completed synchronously.
    pub fn status(&self) -> Status {
        match &self.result {
            Ok(Some(_)) => Status::Ok,
            Ok(None) => Status::NotFound,
            Err(status) => *status,
        }
    }
}
