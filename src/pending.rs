//! Request/response correlation: the pending-invocation registry.
//!
//! Every request/response call registers an entry keyed by its message id.
//! Exactly one of {inbound result, timeout, registry disposal} resolves an
//! entry: atomic removal from the map is the arbiter, so whichever path
//! wins the removal performs the resolution and the losers observe absence
//! and no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use tokio::sync::oneshot;

use crate::error::Error;
use crate::invocation::{MessageId, MethodId};

pub type ResolutionReceiver = oneshot::Receiver<Result<Bytes, Error>>;

pub struct PendingInvocation {
    method_name: Arc<str>,
    method_id: MethodId,
    message_id: MessageId,
    sink: oneshot::Sender<Result<Bytes, Error>>,
    timer: Option<AbortHandle>,
}

impl PendingInvocation {
    #[inline]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    #[inline]
    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    #[inline]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Resolves the awaiting caller. Consumes the entry, so a resolution
    /// can happen at most once per registration.
    pub fn resolve(self, result: Result<Bytes, Error>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }

        if self.sink.send(result).is_err() {
            log::debug!(
                "late resolution for message {} ('{}') dropped: caller gone",
                self.message_id,
                self.method_name
            );
        }
    }

    /// Drops the entry without resolving, stopping its timer.
    fn discard(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

pub struct PendingInvocationRegistry {
    entries: DashMap<MessageId, PendingInvocation>,
    next_id: AtomicU64,
    default_timeout: Duration,
    disposed: AtomicBool,
}

impl PendingInvocationRegistry {
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(0),
            default_timeout,
            disposed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn next_message_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Registers a pending invocation and arms its timeout. A `None`
    /// timeout substitutes the registry default. If the registry is
    /// already disposed the returned receiver resolves immediately as
    /// canceled and nothing is inserted.
    pub fn register(
        self: &Arc<Self>,
        method_name: &str,
        method_id: MethodId,
        message_id: MessageId,
        timeout: Option<Duration>,
    ) -> ResolutionReceiver {
        let (tx, rx) = oneshot::channel();

        if self.disposed.load(Ordering::Acquire) {
            let _ = tx.send(Err(Error::Canceled));
            return rx;
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let (timer, timer_reg) = AbortHandle::new_pair();
        let method_name: Arc<str> = method_name.into();

        self.entries.insert(
            message_id,
            PendingInvocation {
                method_name: method_name.clone(),
                method_id,
                message_id,
                sink: tx,
                timer: Some(timer),
            },
        );

        let registry = Arc::downgrade(self);
        tokio::spawn(Abortable::new(
            async move {
                tokio::time::sleep(timeout).await;

                if let Some(registry) = Weak::upgrade(&registry) {
                    if let Some(pending) = registry.take(message_id) {
                        pending.resolve(Err(Error::Timeout(method_name.to_string())));
                    }
                }
            },
            timer_reg,
        ));

        // a dispose racing the insert above must not leave the entry behind
        if self.disposed.load(Ordering::Acquire) {
            if let Some(pending) = self.take(message_id) {
                pending.resolve(Err(Error::Canceled));
            }
        }

        rx
    }

    /// Atomic remove-and-return; whoever gets the entry owns its
    /// resolution.
    pub fn take(&self, message_id: MessageId) -> Option<PendingInvocation> {
        self.entries.remove(&message_id).map(|(_, pending)| pending)
    }

    /// Resolves an inbound result addressed to `message_id`. Returns false
    /// when the entry was already resolved, timed out, or never existed.
    pub fn complete(&self, message_id: MessageId, payload: Bytes) -> bool {
        match self.take(message_id) {
            Some(pending) => {
                pending.resolve(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Resolves an inbound fault addressed to `message_id`.
    pub fn complete_with_error(&self, message_id: MessageId, error: Error) -> bool {
        match self.take(message_id) {
            Some(pending) => {
                pending.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Removes an entry without resolving it, e.g. after a failed write.
    pub fn forget(&self, message_id: MessageId) {
        if let Some(pending) = self.take(message_id) {
            pending.discard();
        }
    }

    /// Idempotent. Cancels every outstanding entry, looping until the map
    /// is empty so inserts racing the drain are caught too.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let ids: Vec<MessageId> = self.entries.iter().map(|e| *e.key()).collect();
            if ids.is_empty() {
                break;
            }

            for id in ids {
                if let Some(pending) = self.take(id) {
                    pending.resolve(Err(Error::Canceled));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn complete_resolves_exactly_once() {
        let registry = PendingInvocationRegistry::new(Duration::from_secs(5));
        let mid = registry.next_message_id();

        let rx = registry.register("Echo", 1, mid, None);
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.complete(mid, Bytes::from_static(b"ok")));
        assert!(!registry.complete(mid, Bytes::from_static(b"again")));

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_cancels_and_unregisters() {
        let registry = PendingInvocationRegistry::new(Duration::from_secs(5));
        let mid = registry.next_message_id();

        let started = Instant::now();
        let rx = registry.register("Slow", 1, mid, Some(Duration::from_millis(50)));

        let res = rx.await.unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(res, Err(Error::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(45), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn dispose_cancels_outstanding_and_is_idempotent() {
        let registry = PendingInvocationRegistry::new(Duration::from_secs(5));

        let a = registry.register("A", 1, registry.next_message_id(), None);
        let b = registry.register("B", 2, registry.next_message_id(), None);

        registry.dispose();
        registry.dispose();

        assert!(matches!(a.await.unwrap(), Err(Error::Canceled)));
        assert!(matches!(b.await.unwrap(), Err(Error::Canceled)));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn register_after_dispose_resolves_canceled() {
        let registry = PendingInvocationRegistry::new(Duration::from_secs(5));
        registry.dispose();

        let rx = registry.register("Late", 1, registry.next_message_id(), None);

        assert!(matches!(rx.await.unwrap(), Err(Error::Canceled)));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_result_after_timeout_is_a_noop() {
        let registry = PendingInvocationRegistry::new(Duration::from_millis(20));
        let mid = registry.next_message_id();

        let rx = registry.register("Racy", 1, mid, None);
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout(_))));

        // the timeout already won the removal race
        assert!(!registry.complete(mid, Bytes::from_static(b"late")));
    }
}
