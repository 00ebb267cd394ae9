//! Groupcast broadcasts typed method calls to a dynamic set of registered
//! receivers. A receiver is either local (direct dispatch) or a raw write
//! sink for a remote peer; groups can additionally span processes through a
//! pub/sub backplane. Callers address all members, a filtered subset, or
//! exactly one member, and may await a correlated response from that one
//! member.

pub mod backplane;
pub mod composite;
pub mod envelope;
pub mod error;
pub mod group;
pub mod invocation;
pub mod pending;
pub mod provider;
pub mod proxy;
pub mod receiver;
pub mod serializer;

pub use backplane::{Backplane, ByteStream, InMemoryBackplane};
pub use composite::CompositeGroup;
pub use envelope::Envelope;
pub use error::Error;
pub use group::{Group, GroupKey, SyncGroup};
pub use invocation::{method_id, Invocation, MessageId, MethodId, SerializationContext};
pub use pending::PendingInvocationRegistry;
pub use provider::{GroupProvider, GroupProviderBuilder};
pub use proxy::{Multicaster, TargetSelector};
pub use receiver::{DirectWriter, LocalReceiver, ReceiverHandle, RoutedReceiver, Router};
pub use serializer::{MessagePackSerializer, Serializer};
