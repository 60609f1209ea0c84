/*!
 * Device state vectors.
 *
 * The logical state of a device is written only by listeners running on
 * its pipeline worker. Everybody else reads snapshots.
 */
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use portflow_core::types::Timestamp;

/// A value together with the time hardware confirmed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    /// The value
    pub value: T,
    /// When it was confirmed
    pub timestamp: Timestamp,
}

impl<T> Stamped<T> {
    /// Create a new stamped value
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Named boolean channel state of a bit port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortState {
    /// Last known level of each channel; absent until first confirmed
    pub values: BTreeMap<String, bool>,
    /// Time of the last read or write that touched the state
    pub timestamp: Option<Timestamp>,
}

impl PortState {
    /// Last known level of a channel
    pub fn get(&self, name: &str) -> Option<bool> {
        self.values.get(name).copied()
    }

    /// Merge decoded channel levels, leaving every other channel untouched
    pub fn apply<I>(&mut self, values: I, timestamp: Timestamp)
    where
        I: IntoIterator<Item = (String, bool)>,
    {
        self.values.extend(values);
        self.timestamp = Some(timestamp);
    }
}

/// Shared handle to a device's state vector
#[derive(Debug)]
pub struct SharedState<S>(Arc<RwLock<S>>);

impl<S> Clone for SharedState<S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S: Default> Default for SharedState<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> SharedState<S> {
    /// Create a new shared state
    pub fn new(state: S) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    /// Mutate the state
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Read part of the state without cloning all of it
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.0.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

impl<S: Clone> SharedState<S> {
    /// Copy of the current state
    pub fn snapshot(&self) -> S {
        self.read(S::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_apply_merges() {
        let state = SharedState::new(PortState::default());
        let now = Utc::now();

        state.update(|s| s.apply([("a".to_string(), true), ("c".to_string(), true)], now));
        state.update(|s| s.apply([("a".to_string(), false)], now));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.get("a"), Some(false));
        assert_eq!(snapshot.get("c"), Some(true));
        assert_eq!(snapshot.get("b"), None);
        assert_eq!(snapshot.timestamp, Some(now));
    }

    #[test]
    fn test_clones_share_state() {
        let state: SharedState<Option<Stamped<f64>>> = SharedState::default();
        let writer = state.clone();
        writer.update(|s| *s = Some(Stamped::new(1.5, Utc::now())));
        assert_eq!(state.read(|s| s.as_ref().map(|r| r.value)), Some(1.5));
    }

    #[test]
    fn test_state_serializes_by_name() {
        let mut state = PortState::default();
        state.apply([("door".to_string(), true)], Utc::now());

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["values"]["door"], serde_json::json!(true));
        let back: PortState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
