//! # Singleflight
//!
//! Deduplicates simultaneous identical in-flight work. When several callers
//! miss the cache on the same key at the same time, only the first (the
//! *leader*) performs the provider call; the rest (*followers*) wait on a
//! shared channel and receive the leader's value.
//!
//! If the leader is cancelled or gives up without publishing a value, the
//! channel closes and followers fall through to do the work themselves —
//! a closed flight never strands a caller.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// A group of keyed in-flight computations.
pub struct Singleflight<T> {
    flights: Arc<DashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Join the flight for `key`: the first caller becomes the leader and
    /// must eventually call [`FlightGuard::publish`] (or drop the guard to
    /// release followers empty-handed); everyone else gets a receiver.
    pub fn join(&self, key: &str) -> FlightRole<T> {
        match self.flights.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                FlightRole::Follower(entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                FlightRole::Leader(FlightGuard {
                    key: key.to_string(),
                    tx,
                    flights: Arc::clone(&self.flights),
                })
            }
        }
    }

    /// Number of open flights; used by tests and metrics.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Role assigned by [`Singleflight::join`].
pub enum FlightRole<T> {
    Leader(FlightGuard<T>),
    Follower(watch::Receiver<Option<T>>),
}

/// Held by the leader for the duration of the computation. Dropping the
/// guard without publishing closes the channel, waking followers with no
/// value.
pub struct FlightGuard<T> {
    key: String,
    tx: watch::Sender<Option<T>>,
    flights: Arc<DashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T> FlightGuard<T> {
    /// Hand the computed value to every follower and close the flight.
    pub fn publish(self, value: T) {
        let _ = self.tx.send(Some(value));
        // Drop glue removes the map entry.
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

/// Wait for the leader's value. Returns `None` when the leader finished
/// without publishing (failed or cancelled); the caller should then do the
/// work itself.
pub async fn await_leader<T: Clone>(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
    match rx.wait_for(|value| value.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    }
}
