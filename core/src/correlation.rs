//! Per-request response correlation.
//!
//! Ledger round trips answer on a shared asynchronous channel. A
//! [`ResponseRouter`] turns each outstanding request into its own future:
//! register a key before sending, then await the receiver with a timeout while
//! the channel's reader calls [`ResponseRouter::resolve`].
//!
//! ```
//! use ticket_ledger_core::correlation::ResponseRouter;
//!
//! # tokio_test::block_on(async {
//! let router: ResponseRouter<u32, &str> = ResponseRouter::new();
//! let rx = router.register(7);
//! assert!(router.resolve(&7, "signed"));
//! assert_eq!(rx.await.unwrap(), "signed");
//! # });
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Map from request key to the waiting requester.
#[derive(Debug)]
pub struct ResponseRouter<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K: Eq + Hash, V> ResponseRouter<K, V> {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `key`.
    ///
    /// A second registration for the same key replaces the first, whose
    /// receiver then resolves with a closed-channel error.
    pub fn register(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(key, tx);
        }
        rx
    }

    /// Deliver `value` to whoever registered `key`.
    ///
    /// Returns `false` when nobody is waiting (unknown key, or the requester
    /// gave up).
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let sender = self.pending.lock().ok().and_then(|mut p| p.remove(key));
        sender.is_some_and(|s| s.send(value).is_ok())
    }

    /// Drop the registration for `key`, if any.
    pub fn cancel(&self, key: &K) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(key);
        }
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Whether no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, V> Default for ResponseRouter<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_without_waiter_is_false() {
        let router: ResponseRouter<&str, u8> = ResponseRouter::new();
        assert!(!router.resolve(&"missing", 1));
    }

    #[tokio::test]
    async fn reregistering_closes_previous_waiter() {
        let router: ResponseRouter<&str, u8> = ResponseRouter::new();
        let first = router.register("tx");
        let second = router.register("tx");
        assert_eq!(router.len(), 1);
        assert!(router.resolve(&"tx", 2));
        assert!(first.await.is_err());
        assert_eq!(second.await.unwrap(), 2);
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn dropped_receiver_is_not_delivered() {
        let router: ResponseRouter<&str, u8> = ResponseRouter::new();
        drop(router.register("tx"));
        assert!(!router.resolve(&"tx", 1));
    }
}
