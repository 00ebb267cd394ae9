//! The invocation dispatcher callers actually use.
//!
//! A [`Multicaster`] is bound to a target selector and one or two "legs":
//! a group's live membership plus its pending registry and optional
//! backplane link. Composite groups contribute two legs. Fire-and-forget
//! calls fan out to every admitted receiver; request/response calls are
//! restricted to `Single` targets and correlate their response through the
//! leg's pending-invocation registry.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use crate::envelope::{Envelope, KeyList};
use crate::error::Error;
use crate::group::{GroupKey, Membership, RemoteLink};
use crate::invocation::{method_id, Invocation, MessageId, MethodId, SerializationContext};
use crate::pending::PendingInvocationRegistry;
use crate::receiver::ReceiverHandle;
use crate::serializer::Serializer;

/// Addressing mode applied to a group's current membership at call time.
#[derive(Debug, Clone)]
pub enum TargetSelector<K: GroupKey> {
    All,
    Except(KeyList<K>),
    Only(KeyList<K>),
    Single(K),
}

impl<K: GroupKey> TargetSelector<K> {
    pub fn admits(&self, key: &K) -> bool {
        match self {
            TargetSelector::All => true,
            TargetSelector::Except(excludes) => !excludes.contains(key),
            TargetSelector::Only(targets) => targets.contains(key),
            TargetSelector::Single(target) => target == key,
        }
    }

    /// Unkeyed receivers cannot be excluded or targeted: they are admitted
    /// unless the selector carries an explicit target set.
    pub fn includes_unkeyed(&self) -> bool {
        matches!(self, TargetSelector::All | TargetSelector::Except(_))
    }

    pub fn single_key(&self) -> Option<&K> {
        match self {
            TargetSelector::Single(key) => Some(key),
            _ => None,
        }
    }

    fn exclude_list(&self) -> Option<KeyList<K>> {
        match self {
            TargetSelector::Except(excludes) => Some(excludes.clone()),
            _ => None,
        }
    }

    fn target_list(&self) -> Option<KeyList<K>> {
        match self {
            TargetSelector::Only(targets) => Some(targets.clone()),
            TargetSelector::Single(target) => Some(SmallVec::from_elem(target.clone(), 1)),
            _ => None,
        }
    }
}

/// One group's share of a multicaster: its live membership view, its
/// correlation registry and, for backplane-backed groups, the publish side
/// of the link.
pub(crate) struct Leg<K: GroupKey> {
    pub(crate) membership: Arc<Membership<K>>,
    pub(crate) pending: Arc<PendingInvocationRegistry>,
    pub(crate) remote: Option<RemoteLink>,
}

impl<K: GroupKey> Clone for Leg<K> {
    fn clone(&self) -> Self {
        Self {
            membership: self.membership.clone(),
            pending: self.pending.clone(),
            remote: self.remote.clone(),
        }
    }
}

pub struct Multicaster<K: GroupKey> {
    selector: TargetSelector<K>,
    serializer: Arc<dyn Serializer>,
    legs: SmallVec<[Leg<K>; 2]>,
}

impl<K: GroupKey> Multicaster<K> {
    pub(crate) fn new(
        selector: TargetSelector<K>,
        serializer: Arc<dyn Serializer>,
        legs: SmallVec<[Leg<K>; 2]>,
    ) -> Self {
        Self {
            selector,
            serializer,
            legs,
        }
    }

    pub fn selector(&self) -> &TargetSelector<K> {
        &self.selector
    }

    /// Fire-and-forget broadcast. Per-receiver faults are logged and
    /// discarded; delivery always continues to the remaining receivers.
    pub async fn invoke<A: Serialize>(&self, method: &str, args: &A) -> Result<(), Error> {
        self.invoke_with_method_id(method, method_id(method), args)
            .await
    }

    /// Fire-and-forget with an explicit method id override.
    pub async fn invoke_with_method_id<A: Serialize>(
        &self,
        method: &str,
        id: MethodId,
        args: &A,
    ) -> Result<(), Error> {
        let (invocation, frame) = self.encode(method, id, None, args)?;

        for leg in &self.legs {
            match &leg.remote {
                Some(link) => {
                    // exclude/target refinement rides in the envelope; the
                    // backplane itself multicasts to every subscriber
                    let envelope = Envelope::new(
                        self.selector.exclude_list(),
                        self.selector.target_list(),
                        frame.clone(),
                    );

                    if let Err(err) = link
                        .backplane
                        .publish(&link.channel, envelope.encode(&*self.serializer)?)
                        .await
                    {
                        log::warn!("publish to '{}' failed: {}", link.channel, err);
                    }
                }
                None => self.fan_out_direct(leg, &invocation, &frame),
            }
        }

        Ok(())
    }

    /// Request/response call. Requires a `Single` selector whose key is a
    /// current member; fails fast with [`Error::NoInvocableTarget`]
    /// otherwise instead of hanging.
    pub async fn invoke_with_result<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, Error> {
        self.invoke_with_result_by_id(method, method_id(method), args, timeout)
            .await
    }

    pub async fn invoke_with_result_by_id<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        id: MethodId,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, Error> {
        let payload = self.invoke_pending(method, id, args, timeout).await?;

        let ctx = SerializationContext {
            method_name: method,
            method_id: id,
            message_id: None,
        };

        let serializer: &dyn Serializer = &*self.serializer;
        serializer.decode_value(&payload, &ctx)
    }

    /// Request/response call that awaits acknowledgement but carries no
    /// return value.
    pub async fn invoke_with_result_unit<A: Serialize>(
        &self,
        method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.invoke_pending(method, method_id(method), args, timeout)
            .await?;

        Ok(())
    }

    async fn invoke_pending<A: Serialize>(
        &self,
        method: &str,
        id: MethodId,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<Bytes, Error> {
        let key = match self.selector.single_key() {
            Some(key) => key,
            None => return Err(Error::NotSingleTarget),
        };

        let (leg, handle) = self
            .legs
            .iter()
            .find_map(|leg| leg.membership.get(key).map(|handle| (leg, handle)))
            .ok_or_else(|| Error::NoInvocableTarget(format!("{:?}", key)))?;

        let message_id = leg.pending.next_message_id();
        let (invocation, frame) = self.encode(method, id, Some(message_id), args)?;

        let rx = leg.pending.register(method, id, message_id, timeout);

        let written = match &handle {
            ReceiverHandle::Local(receiver) => receiver.on_invocation(&invocation),
            ReceiverHandle::Remote(writer) => writer.write(frame),
        };

        if let Err(err) = written {
            leg.pending.forget(message_id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ResolutionLost),
        }
    }

    fn fan_out_direct(&self, leg: &Leg<K>, invocation: &Invocation, frame: &Bytes) {
        for (key, handle) in leg.membership.keyed().iter() {
            if !self.selector.admits(key) {
                continue;
            }

            deliver(handle, invocation, frame);
        }

        if self.selector.includes_unkeyed() {
            for handle in leg.membership.unkeyed().values() {
                deliver(handle, invocation, frame);
            }
        }
    }

    fn encode<A: Serialize>(
        &self,
        method: &str,
        id: MethodId,
        message_id: Option<MessageId>,
        args: &A,
    ) -> Result<(Invocation, Bytes), Error> {
        let ctx = SerializationContext {
            method_name: method,
            method_id: id,
            message_id,
        };

        let mut buf = Vec::new();
        self.serializer.serialize_args(&mut buf, args, &ctx)?;

        let invocation = Invocation {
            method_id: id,
            message_id,
            args: buf.into(),
        };
        let frame = invocation.frame()?;

        Ok((invocation, frame))
    }
}

fn deliver(handle: &ReceiverHandle, invocation: &Invocation, frame: &Bytes) {
    let res = match handle {
        ReceiverHandle::Local(receiver) => receiver.on_invocation(invocation),
        ReceiverHandle::Remote(writer) => writer.write(frame.clone()),
    };

    if let Err(err) = res {
        // one bad receiver never blocks or fails the others
        log::warn!("receiver invocation fault ignored: {}", err);
    }
}
