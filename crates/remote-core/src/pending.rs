use crate::identity::CorrelationToken;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
    #[error("no pending request for token {0}")]
    Unknown(CorrelationToken),
    #[error("request {0} is already being awaited")]
    AlreadyAwaited(CorrelationToken),
    #[error("request {token} timed out after {timeout:?}")]
    Timeout {
        token: CorrelationToken,
        timeout: Duration,
    },
    #[error("request {0} was cancelled")]
    Cancelled(CorrelationToken),
}

struct Slot<T> {
    sender: Option<oneshot::Sender<T>>,
    receiver: Option<oneshot::Receiver<T>>,
}

struct SlotGuard<'a, T> {
    table: &'a PendingRequestTable<T>,
    token: &'a CorrelationToken,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.table.lock().remove(self.token);
    }
}

/// Outstanding requests keyed by correlation token.
///
/// Each token owns a oneshot channel: `resolve` fills it at most once and
/// `wait` suspends only its caller until the value arrives, the timeout
/// elapses or the slot is cancelled. A slot is consumed by whichever of those
/// happens first; afterwards the token is unknown and late replies are
/// discarded.
pub struct PendingRequestTable<T> {
    slots: Mutex<HashMap<CorrelationToken, Slot<T>>>,
}

impl<T> Default for PendingRequestTable<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingRequestTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationToken, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issue(&self) -> CorrelationToken {
        let mut slots = self.lock();
        loop {
            let token = CorrelationToken::mint();
            if slots.contains_key(&token) {
                continue;
            }
            let (sender, receiver) = oneshot::channel();
            slots.insert(
                token.clone(),
                Slot {
                    sender: Some(sender),
                    receiver: Some(receiver),
                },
            );
            return token;
        }
    }

    pub async fn wait(&self, token: &CorrelationToken, timeout: Duration) -> Result<T, PendingError> {
        let mut receiver = {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(token)
                .ok_or_else(|| PendingError::Unknown(token.clone()))?;
            slot.receiver
                .take()
                .ok_or_else(|| PendingError::AlreadyAwaited(token.clone()))?
        };
        // Removes the slot however this future ends, including when the caller
        // drops it mid-wait.
        let guard = SlotGuard { table: self, token };

        let outcome = tokio::time::timeout(timeout, &mut receiver).await;
        // Once the slot is gone no resolve can land, so a value that raced the
        // deadline is either already in the channel or lost for good.
        drop(guard);
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PendingError::Cancelled(token.clone())),
            Err(_) => receiver.try_recv().map_err(|_| PendingError::Timeout {
                token: token.clone(),
                timeout,
            }),
        }
    }

    /// Delivers `value` to the waiter of `token`. Returns false for unknown,
    /// expired or already resolved tokens.
    ///
    /// With a waiter attached the slot is released here; otherwise the value
    /// stays buffered in the slot until `wait` collects it.
    pub fn resolve(&self, token: &CorrelationToken, value: T) -> bool {
        let sender = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(token) else {
                debug!(event = "pending_resolve_discarded", token = %token);
                return false;
            };
            let sender = slot.sender.take();
            if slot.receiver.is_none() {
                slots.remove(token);
            }
            sender
        };
        match sender {
            Some(sender) => {
                let delivered = sender.send(value).is_ok();
                if !delivered {
                    debug!(event = "pending_resolve_late", token = %token);
                }
                delivered
            }
            None => {
                debug!(event = "pending_resolve_discarded", token = %token);
                false
            }
        }
    }

    pub fn cancel(&self, token: &CorrelationToken) -> bool {
        self.lock().remove(token).is_some()
    }

    pub fn cancel_all(&self) -> usize {
        let mut slots = self.lock();
        let count = slots.len();
        slots.clear();
        count
    }

    pub fn is_pending(&self, token: &CorrelationToken) -> bool {
        self.lock()
            .get(token)
            .map(|slot| slot.sender.is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolve_wakes_waiter_with_payload() {
        let table = Arc::new(PendingRequestTable::<String>::new());
        let token = table.issue();

        let waiter = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move { table.wait(&token, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.resolve(&token, "done".to_string()));

        let result = waiter.await.expect("join");
        assert_eq!(result, Ok("done".to_string()));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn resolve_before_wait_is_buffered() {
        let table = PendingRequestTable::<u32>::new();
        let token = table.issue();
        assert!(table.resolve(&token, 7));
        assert_eq!(table.wait(&token, Duration::from_millis(50)).await, Ok(7));
    }

    #[tokio::test]
    async fn resolve_is_effective_at_most_once() {
        let table = PendingRequestTable::<u32>::new();
        let token = table.issue();
        assert!(table.resolve(&token, 1));
        assert!(!table.resolve(&token, 2));
        assert!(!table.is_pending(&token));
        assert_eq!(table.wait(&token, Duration::from_millis(50)).await, Ok(1));
    }

    #[tokio::test]
    async fn timeout_consumes_slot_and_late_resolve_is_noop() {
        let table = PendingRequestTable::<u32>::new();
        let token = table.issue();
        let result = table.wait(&token, Duration::from_millis(30)).await;
        assert!(matches!(result, Err(PendingError::Timeout { .. })));
        assert!(table.is_empty());
        assert!(!table.resolve(&token, 5));
        assert_eq!(
            table.wait(&token, Duration::from_millis(10)).await,
            Err(PendingError::Unknown(token.clone()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_releases_waiters_as_cancelled() {
        let table = Arc::new(PendingRequestTable::<u32>::new());
        let first = table.issue();
        let second = table.issue();
        assert_ne!(first, second);

        let waiters: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|token| {
                let table = table.clone();
                tokio::spawn(async move { table.wait(&token, Duration::from_secs(5)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.cancel_all(), 2);

        for waiter in waiters {
            let result = waiter.await.expect("join");
            assert!(matches!(result, Err(PendingError::Cancelled(_))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_waiter_releases_its_slot() {
        let table = Arc::new(PendingRequestTable::<u32>::new());
        let token = table.issue();
        let waiter = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move { table.wait(&token, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        assert!(table.is_empty());
        assert!(!table.resolve(&token, 4));
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resolve_with_waiter_attached_frees_slot() {
        let table = Arc::new(PendingRequestTable::<u32>::new());
        let token = table.issue();
        let waiter = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move { table.wait(&token, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(table.resolve(&token, 9));
        assert!(table.is_empty());
        assert_eq!(waiter.await.expect("join"), Ok(9));
    }

    #[tokio::test]
    async fn second_waiter_on_same_token_is_refused() {
        let table = Arc::new(PendingRequestTable::<u32>::new());
        let token = table.issue();
        let first = {
            let table = table.clone();
            let token = token.clone();
            tokio::spawn(async move { table.wait(&token, Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            table.wait(&token, Duration::from_millis(10)).await,
            Err(PendingError::AlreadyAwaited(token.clone()))
        );
        assert!(table.resolve(&token, 3));
        assert_eq!(first.await.expect("join"), Ok(3));
    }
}
