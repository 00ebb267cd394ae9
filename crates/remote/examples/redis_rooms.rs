//! Broadcast demo over a Redis backplane.
//!
//! Run a Redis server locally, then start two instances of this example
//! with different peer names:
//!
//! ```bash
//! cargo run --example redis_rooms -- alice
//! cargo run --example redis_rooms -- bob
//! ```
//!
//! Each instance registers one write sink in the "lobby" group and
//! broadcasts a greeting every second; both instances print everything
//! the channel carries.

use std::sync::Arc;

use bytes::Bytes;
use groupcast::{
    DirectWriter, Error, GroupProvider, Invocation, MessagePackSerializer, ReceiverHandle,
    SerializationContext, Serializer,
};
use groupcast_remote::RedisBackplane;
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Greeting {
    from: String,
    text: String,
}

struct PrintSink {
    peer: String,
}

impl DirectWriter for PrintSink {
    fn write(&self, payload: Bytes) -> Result<(), Error> {
        let invocation = Invocation::decode(payload)?;

        let ctx = SerializationContext {
            method_name: "OnGreeting",
            method_id: invocation.method_id,
            message_id: invocation.message_id,
        };

        let serializer: &dyn Serializer = &MessagePackSerializer;
        let greeting: Greeting = serializer.decode_value(&invocation.args, &ctx)?;

        println!("[{}] {}: {}", self.peer, greeting.from, greeting.text);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let peer = std::env::args().nth(1).unwrap_or_else(|| "anon".to_string());

    let backplane = Arc::new(RedisBackplane::open("redis://127.0.0.1/")?);
    let provider = GroupProvider::builder().backplane(backplane).build();

    let lobby = provider.get_or_add_group::<String>("lobby")?;
    lobby
        .add(
            peer.clone(),
            ReceiverHandle::remote(PrintSink { peer: peer.clone() }),
        )
        .await?;

    let mut n = 0u32;
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        n += 1;
        lobby
            .all()
            .invoke(
                "OnGreeting",
                &Greeting {
                    from: peer.clone(),
                    text: format!("hello #{}", n),
                },
            )
            .await?;
    }
}
