//! Receiver handles and the runtime method-routing table.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::invocation::{method_id, Invocation, MethodId, SerializationContext};
use crate::serializer::Serializer;

/// A receiver reachable by direct dispatch in this process.
pub trait LocalReceiver: Send + Sync + 'static {
    fn on_invocation(&self, invocation: &Invocation) -> Result<(), Error>;
}

/// A write sink for a peer reachable over a transport: accepts fully
/// framed invocation bytes.
pub trait DirectWriter: Send + Sync + 'static {
    fn write(&self, payload: Bytes) -> Result<(), Error>;
}

/// How a receiver is held inside a group's membership table.
#[derive(Clone)]
pub enum ReceiverHandle {
    Local(Arc<dyn LocalReceiver>),
    Remote(Arc<dyn DirectWriter>),
}

impl ReceiverHandle {
    pub fn local<R: LocalReceiver>(receiver: R) -> Self {
        ReceiverHandle::Local(Arc::new(receiver))
    }

    pub fn remote<W: DirectWriter>(writer: W) -> Self {
        ReceiverHandle::Remote(Arc::new(writer))
    }

    /// Remote-capable receivers can supply a direct write sink and are the
    /// only handles a backplane-backed group accepts.
    #[inline]
    pub fn is_remote_capable(&self) -> bool {
        matches!(self, ReceiverHandle::Remote(_))
    }
}

type BoxedHandler<S> = Box<dyn Fn(&S, &Invocation) -> Result<(), Error> + Send + Sync>;

/// Method-id → handler table. Built once per receiver shape and shared
/// across every instance of that shape through [`RoutedReceiver`].
pub struct Router<S> {
    serializer: Arc<dyn Serializer>,
    handlers: HashMap<MethodId, (Arc<str>, BoxedHandler<S>)>,
}

impl<S: Send + Sync + 'static> Router<S> {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            serializer,
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler under the method's FNV-1a id.
    pub fn on<A, F>(&mut self, method: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        F: Fn(&S, A) + Send + Sync + 'static,
    {
        self.on_with_id(method, method_id(method), f)
    }

    /// Registers a handler under an explicit method id override.
    pub fn on_with_id<A, F>(&mut self, method: &str, id: MethodId, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        F: Fn(&S, A) + Send + Sync + 'static,
    {
        let name: Arc<str> = method.into();
        let serializer = self.serializer.clone();
        let handler_name = name.clone();

        let handler: BoxedHandler<S> = Box::new(move |state, invocation| {
            let ctx = SerializationContext {
                method_name: &handler_name,
                method_id: invocation.method_id,
                message_id: invocation.message_id,
            };

            let args: A = serializer.decode_value(&invocation.args, &ctx)?;
            f(state, args);

            Ok(())
        });

        self.handlers.insert(id, (name, handler));
        self
    }

    pub fn dispatch(&self, state: &S, invocation: &Invocation) -> Result<(), Error> {
        match self.handlers.get(&invocation.method_id) {
            Some((_, handler)) => handler(state, invocation),
            None => {
                log::warn!(
                    "no handler registered for method id {:#010x}, skipping",
                    invocation.method_id
                );
                Ok(())
            }
        }
    }

    pub fn method_name(&self, id: MethodId) -> Option<&str> {
        self.handlers.get(&id).map(|(name, _)| name.as_ref())
    }
}

/// Binds a shared [`Router`] to one receiver's state.
pub struct RoutedReceiver<S> {
    state: Arc<S>,
    router: Arc<Router<S>>,
}

impl<S: Send + Sync + 'static> RoutedReceiver<S> {
    pub fn new(state: Arc<S>, router: Arc<Router<S>>) -> Self {
        Self { state, router }
    }
}

impl<S: Send + Sync + 'static> LocalReceiver for RoutedReceiver<S> {
    fn on_invocation(&self, invocation: &Invocation) -> Result<(), Error> {
        self.router.dispatch(&self.state, invocation)
    }
}
