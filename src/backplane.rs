//! The pub/sub backplane seam and the pure in-process implementation.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::error::Error;

pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// A distributed pub/sub transport. One channel carries one group's
/// traffic; the backplane multicasts every published message to every
/// subscriber of the channel, including the publisher's own process.
///
/// Ordering: messages from a single publisher are delivered in publish
/// order when the underlying transport preserves it (true for the
/// in-memory implementation and for a single connection); no order is
/// guaranteed across independent publishers.
#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Error>;

    /// Opens a subscription stream. The stream ends when the subscription
    /// is dropped or the backplane shuts the channel down.
    async fn subscribe(&self, channel: &str) -> Result<ByteStream, Error>;
}

/// In-process backplane: publish is a direct local fan-out to every
/// subscriber's queue.
#[derive(Default)]
pub struct InMemoryBackplane {
    channels: DashMap<String, Vec<UnboundedSender<Bytes>>>,
}

impl InMemoryBackplane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Backplane for InMemoryBackplane {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Error> {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            // dropped subscriptions are reaped here
            subs.retain(|tx| tx.send(payload.clone()).is_ok());
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        self.channels
            .entry(channel.to_string())
            .or_insert_with(Vec::new)
            .push(tx);

        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let bp = InMemoryBackplane::new();

        let mut a = bp.subscribe("room").await.unwrap();
        let mut b = bp.subscribe("room").await.unwrap();

        bp.publish("room", Bytes::from_static(b"one")).await.unwrap();
        bp.publish("room", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn dropped_subscription_is_reaped() {
        let bp = InMemoryBackplane::new();

        let stream = bp.subscribe("room").await.unwrap();
        assert_eq!(bp.subscriber_count("room"), 1);

        drop(stream);
        bp.publish("room", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(bp.subscriber_count("room"), 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bp = InMemoryBackplane::new();

        let mut a = bp.subscribe("a").await.unwrap();
        bp.publish("b", Bytes::from_static(b"nope")).await.unwrap();
        bp.publish("a", Bytes::from_static(b"yes")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"yes"));
    }
}
