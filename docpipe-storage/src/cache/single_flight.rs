//! Per-key request coalescing.
//!
//! The first caller for a key becomes the leader and computes; everyone who
//! arrives while it runs subscribes to a watch channel and receives the
//! leader's result. A leader that goes away without completing (its future
//! was dropped) closes the channel, and the followers race to lead again.

use docpipe_core::{DocpipeError, DocpipeResult, ResilienceError, WaitPhase};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;

type Shared = Option<Result<Arc<Vec<u8>>, DocpipeError>>;

#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    flights: Mutex<HashMap<String, watch::Sender<Shared>>>,
}

pub(crate) enum Role<'a> {
    Leader(FlightGuard<'a>),
    Follower(watch::Receiver<Shared>),
}

impl SingleFlight {
    // The map is only touched by insert and remove, both of which leave it
    // consistent if a holder panics.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Shared>>> {
        self.flights.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn join(&self, key: &str) -> Role<'_> {
        let mut flights = self.lock();
        if let Some(tx) = flights.get(key) {
            return Role::Follower(tx.subscribe());
        }
        let (tx, _) = watch::channel(None);
        flights.insert(key.to_string(), tx);
        Role::Leader(FlightGuard {
            owner: self,
            key: key.to_string(),
            completed: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

/// Leadership of one key. Dropping it without `complete` abandons the flight.
pub(crate) struct FlightGuard<'a> {
    owner: &'a SingleFlight,
    key: String,
    completed: bool,
}

impl FlightGuard<'_> {
    pub(crate) fn complete(mut self, result: Result<Arc<Vec<u8>>, DocpipeError>) {
        self.completed = true;
        // Remove first so late arrivals start a fresh flight and find the
        // value in the cache instead of a finished channel.
        if let Some(tx) = self.owner.lock().remove(&self.key) {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(key = %self.key, "Single-flight leader abandoned computation");
            self.owner.lock().remove(&self.key);
        }
    }
}

/// Wait for the leader's result.
///
/// `Ok(None)` means the leader was abandoned and the caller should try to
/// lead. Leader errors are returned as-is.
pub(crate) async fn wait_for_leader(
    mut rx: watch::Receiver<Shared>,
    deadline: Option<Instant>,
) -> DocpipeResult<Option<Arc<Vec<u8>>>> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result.map(Some);
        }

        let changed = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, rx.changed())
                .await
                .map_err(|_| ResilienceError::DeadlineExceeded {
                    phase: WaitPhase::SingleFlight,
                })?,
            None => rx.changed().await,
        };

        if changed.is_err() {
            // Sender gone. A completed leader sends before dropping, so the
            // value is still readable here.
            return match rx.borrow().clone() {
                Some(result) => result.map(Some),
                None => Ok(None),
            };
        }
    }
}
