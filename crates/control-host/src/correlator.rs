//! Request/response correlation over an asynchronous duplex channel.
//!
//! A caller registers a key (a message id on the control socket, the expected
//! response type on the API socket) and awaits the paired receiver. The read
//! side resolves keys as responses arrive. Timeout is the only cancellation path.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;

pub struct Correlator<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K, V> Default for Correlator<K, V> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Correlator<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, oneshot::Sender<V>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a resolver for `key`. A duplicate key replaces the earlier
    /// resolver, whose waiter then sees a closed channel.
    pub fn register(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(key.clone(), tx).is_some() {
            debug!(?key, "replaced pending resolver for duplicate key");
        }
        rx
    }

    /// Hand `value` to the waiter registered under `key`.
    ///
    /// Returns the value back when nobody is waiting (never registered,
    /// already resolved, or timed out).
    pub fn resolve(&self, key: &K, value: V) -> Result<(), V> {
        let sender = self.lock().remove(key);
        match sender {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }

    pub fn cancel(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for a registered key, giving up after `timeout`.
    pub async fn wait(&self, key: &K, rx: oneshot::Receiver<V>, timeout: Duration) -> Option<V> {
        match time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => {
                debug!(?key, "pending resolver dropped before a response arrived");
                None
            }
            Err(_) => {
                let mut pending = self.lock();
                // Leave a newer registration under the same key alone.
                if pending.get(key).is_some_and(|tx| tx.is_closed()) {
                    pending.remove(key);
                }
                debug!(?key, ?timeout, "request timed out");
                None
            }
        }
    }

    /// Register `key`, run `send`, and await the response.
    ///
    /// `send` returning false means nothing went out; the caller gets `None`
    /// immediately instead of waiting for the deadline.
    pub async fn send_and_await<F>(&self, key: K, timeout: Duration, send: F) -> Option<V>
    where
        F: FnOnce() -> bool,
    {
        let rx = self.register(key.clone());
        if !send() {
            self.cancel(&key);
            return None;
        }
        self.wait(&key, rx, timeout).await
    }
}
