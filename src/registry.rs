//! Pending-request registry.
//!
//! Maps live correlation IDs to single-shot completion slots. The request
//! engine inserts, and whichever of {callback consumer, timer, cancellation,
//! disposal} reaches a waiter first removes and fulfils it; everyone else
//! sees the key gone and walks away. Removal and completion happen under
//! one lock acquisition per key, so a waiter is completed at most once.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::packet::ResponsePacket;

/// Terminal outcome delivered to a waiter.
pub type Completion = Result<ResponsePacket>;

struct Waiter {
    slot: oneshot::Sender<Completion>,
    /// Timer/cancellation watcher task, aborted at the terminal transition.
    watcher: Option<JoinHandle<()>>,
}

/// Concurrent map of correlation ID to waiter.
#[derive(Default)]
pub struct PendingRegistry {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a waiter for a correlation ID and hand back its receiver.
    ///
    /// Fails with `AlreadyRegistered` if the ID is live; correlation IDs
    /// carry enough entropy that a collision is a programmer error.
    pub fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<Completion>> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.contains_key(correlation_id) {
            return Err(ClientError::AlreadyRegistered(correlation_id.to_string()));
        }
        let (slot, receiver) = oneshot::channel();
        waiters.insert(
            correlation_id.to_string(),
            Waiter {
                slot,
                watcher: None,
            },
        );
        Ok(receiver)
    }

    /// Attach the timer/cancellation watcher task to a live waiter.
    ///
    /// If the waiter already reached a terminal state the task is aborted
    /// immediately.
    pub fn attach_watcher(&self, correlation_id: &str, watcher: JoinHandle<()>) {
        let mut waiters = self.waiters.lock().unwrap();
        match waiters.get_mut(correlation_id) {
            Some(waiter) => waiter.watcher = Some(watcher),
            None => watcher.abort(),
        }
    }

    /// Whether a waiter is live for this correlation ID.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.lock().unwrap().contains_key(correlation_id)
    }

    /// Remove and fulfil the waiter. Returns whether a waiter existed.
    pub fn complete(&self, correlation_id: &str, result: Completion) -> bool {
        let waiter = self.waiters.lock().unwrap().remove(correlation_id);
        match waiter {
            Some(waiter) => {
                if let Some(watcher) = waiter.watcher {
                    watcher.abort();
                }
                if waiter.slot.send(result).is_err() {
                    debug!(correlation_id, "waiter receiver already gone");
                }
                true
            }
            None => false,
        }
    }

    /// Remove a waiter without fulfilling it. Used when `send` fails after
    /// registration and will report the error to the caller directly.
    pub fn remove(&self, correlation_id: &str) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(correlation_id) {
            if let Some(watcher) = waiter.watcher {
                watcher.abort();
            }
        }
    }

    /// Remove every waiter and fail each with the supplied error.
    pub fn cancel_all(&self, error: impl Fn() -> ClientError) {
        let drained: Vec<(String, Waiter)> =
            self.waiters.lock().unwrap().drain().collect();
        for (correlation_id, waiter) in drained {
            if let Some(watcher) = waiter.watcher {
                watcher.abort();
            }
            if waiter.slot.send(Err(error())).is_err() {
                debug!(correlation_id = %correlation_id, "waiter receiver already gone");
            }
        }
    }

    /// Number of live waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Whether no waiters are live.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_complete_round_trip() {
        let registry = PendingRegistry::new();
        let rx = registry.register("c1").unwrap();
        assert!(registry.contains("c1"));

        assert!(registry.complete("c1", Ok(ResponsePacket::ok(b"hi".to_vec()))));
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.body, b"hi");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = PendingRegistry::new();
        let _rx = registry.register("c1").unwrap();
        let err = registry.register("c1").unwrap_err();
        assert!(matches!(err, ClientError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_completion_is_single_shot() {
        let registry = PendingRegistry::new();
        let rx = registry.register("c1").unwrap();

        assert!(registry.complete("c1", Err(ClientError::Timeout)));
        // The waiter is gone; later completions report no waiter.
        assert!(!registry.complete("c1", Ok(ResponsePacket::empty_ok())));

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_every_waiter() {
        let registry = PendingRegistry::new();
        let rx1 = registry.register("c1").unwrap();
        let rx2 = registry.register("c2").unwrap();

        registry.cancel_all(|| ClientError::Disposed);

        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Disposed)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Disposed)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_drops_waiter_silently() {
        let registry = PendingRegistry::new();
        let rx = registry.register("c1").unwrap();
        registry.remove("c1");
        assert!(!registry.contains("c1"));
        // The slot was dropped without a send.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_watcher_aborted_on_completion() {
        let registry = PendingRegistry::new();
        let _rx = registry.register("c1").unwrap();
        let watcher = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        registry.attach_watcher("c1", watcher);

        registry.complete("c1", Ok(ResponsePacket::empty_ok()));
        // Aborting is fire-and-forget; yield so the abort lands.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_watcher_for_completed_waiter_aborted_immediately() {
        let registry = PendingRegistry::new();
        let watcher = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        registry.attach_watcher("gone", watcher);
        tokio::task::yield_now().await;
    }
}
