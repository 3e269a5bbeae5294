//! Per-user turn serialization.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::Mutex;

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Serializes turns of the same user end to end. Different users never wait
/// on each other beyond the brief map lookup.
///
/// The map sits behind a std mutex: it is never held across an `.await`,
/// which lets the cleanup run from `Drop` when a turn is cancelled.
#[derive(Debug, Default)]
pub struct TurnGate {
    locks: StdMutex<LockMap>,
}

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `turn` while holding `user_id`'s lock.
    pub async fn run<F>(&self, user_id: &str, turn: F) -> F::Output
    where
        F: Future,
    {
        let entry = self.enter(user_id);
        let _held = entry.lock.lock().await;
        turn.await
    }

    fn enter<'a>(&'a self, user_id: &'a str) -> GateEntry<'a> {
        let lock = self.map().entry(user_id.to_string()).or_default().clone();
        GateEntry {
            gate: self,
            user_id,
            lock,
        }
    }

    /// Users with a live lock entry.
    pub fn active_users(&self) -> usize {
        self.map().len()
    }
}

/// One turn's claim on a user lock. Dropping it, whether the turn finished
/// or was cancelled, prunes the map entry once nobody else holds it.
struct GateEntry<'a> {
    gate: &'a TurnGate,
    user_id: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for GateEntry<'_> {
    fn drop(&mut self) {
        let mut locks = self.gate.map();
        // Two holders means the map and us: nobody is queued behind.
        if locks
            .get(self.user_id)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2)
        {
            locks.remove(self.user_id);
        }
    }
}
