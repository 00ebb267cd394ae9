//! Redis pub/sub backplane.
//!
//! Publishing goes through one shared multiplexed connection; each group
//! subscription gets its own pub/sub connection, since Redis dedicates a
//! connection to subscriber mode. Dropping the subscription stream closes
//! that connection, which is how the group's receive loop cancellation
//! takes effect.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use groupcast::{Backplane, ByteStream};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::Error;

pub struct RedisBackplane {
    client: redis::Client,
    publish_conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackplane {
    /// `url` in the usual `redis://host:port/db` form.
    pub fn open(url: &str) -> Result<Self, Error> {
        Ok(Self {
            client: redis::Client::open(url)?,
            publish_conn: Mutex::new(None),
        })
    }

    async fn publish_connection(&self) -> Result<MultiplexedConnection, Error> {
        let mut cached = self.publish_conn.lock().await;

        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_tokio_connection().await?;
        *cached = Some(conn.clone());

        Ok(conn)
    }

    async fn do_publish(&self, channel: &str, payload: Bytes) -> Result<(), Error> {
        let mut conn = self.publish_connection().await?;

        let res: redis::RedisResult<()> = conn.publish(channel, payload.as_ref()).await;
        if let Err(err) = res {
            // a broken connection is reopened on the next publish
            *self.publish_conn.lock().await = None;
            log::warn!("publish on '{}' failed: {}", channel, err);
            return Err(err.into());
        }

        Ok(())
    }

    async fn do_subscribe(&self, channel: &str) -> Result<ByteStream, Error> {
        let conn = self.client.get_tokio_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;

        log::debug!("subscribed to '{}'", channel);

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), groupcast::Error> {
        self.do_publish(channel, payload).await.map_err(Into::into)
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, groupcast::Error> {
        self.do_subscribe(channel).await.map_err(Into::into)
    }
}
