//! Group membership, subscription lifecycle and inbound fan-out.
//!
//! A group owns a membership table (keyed plus unkeyed registrations) and a
//! subscription state machine. Backplane-backed groups additionally run a
//! background receive loop that decodes inbound envelopes and fans them out
//! to the locally registered receivers.
//!
//! Membership mutation and state transitions are serialized by one mutex.
//! Broadcast iteration reads a copy-on-write snapshot and never observes a
//! torn table.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use parking_lot::Mutex;
use smallvec::smallvec;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backplane::Backplane;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::invocation::Invocation;
use crate::pending::PendingInvocationRegistry;
use crate::proxy::{Leg, Multicaster, TargetSelector};
use crate::receiver::ReceiverHandle;
use crate::serializer::Serializer;

/// Blanket bound for the identifier a receiver is registered under.
pub trait GroupKey:
    Clone
    + Eq
    + Hash
    + fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> GroupKey for T where
    T: Clone
        + Eq
        + Hash
        + fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Copy-on-write membership table. Mutators run under the owning group's
/// lock; readers load the current snapshot without locking.
pub(crate) struct Membership<K: GroupKey> {
    keyed: ArcSwap<HashMap<K, ReceiverHandle>>,
    unkeyed: ArcSwap<HashMap<u64, ReceiverHandle>>,
}

impl<K: GroupKey> Membership<K> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            keyed: ArcSwap::from_pointee(HashMap::new()),
            unkeyed: ArcSwap::from_pointee(HashMap::new()),
        })
    }

    pub(crate) fn keyed(&self) -> Arc<HashMap<K, ReceiverHandle>> {
        self.keyed.load_full()
    }

    pub(crate) fn unkeyed(&self) -> Arc<HashMap<u64, ReceiverHandle>> {
        self.unkeyed.load_full()
    }

    pub(crate) fn get(&self, key: &K) -> Option<ReceiverHandle> {
        self.keyed.load().get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.keyed.load().len() + self.unkeyed.load().len()
    }

    fn insert(&self, key: K, handle: ReceiverHandle) {
        let mut map = HashMap::clone(&self.keyed.load());
        map.insert(key, handle);
        self.keyed.store(Arc::new(map));
    }

    fn remove(&self, key: &K) -> bool {
        if !self.keyed.load().contains_key(key) {
            return false;
        }

        let mut map = HashMap::clone(&self.keyed.load());
        map.remove(key);
        self.keyed.store(Arc::new(map));
        true
    }

    fn insert_unkeyed(&self, id: u64, handle: ReceiverHandle) {
        let mut map = HashMap::clone(&self.unkeyed.load());
        map.insert(id, handle);
        self.unkeyed.store(Arc::new(map));
    }

    fn remove_unkeyed(&self, id: u64) -> bool {
        if !self.unkeyed.load().contains_key(&id) {
            return false;
        }

        let mut map = HashMap::clone(&self.unkeyed.load());
        map.remove(&id);
        self.unkeyed.store(Arc::new(map));
        true
    }

    fn clear(&self) {
        self.keyed.store(Arc::new(HashMap::new()));
        self.unkeyed.store(Arc::new(HashMap::new()));
    }
}

/// Backplane binding for one group: where its broadcasts are published and
/// its subscription listens.
#[derive(Clone)]
pub(crate) struct RemoteLink {
    pub(crate) backplane: Arc<dyn Backplane>,
    pub(crate) channel: Arc<str>,
}

struct StoredScope {
    id: u64,
    abort: AbortHandle,
    join: JoinHandle<()>,
}

struct ScopeReady {
    id: u64,
    rx: oneshot::Receiver<Result<(), Error>>,
}

struct GroupState {
    subscribed: bool,
    subscription: Option<StoredScope>,
    disposed: bool,
    next_unkeyed_id: u64,
}

type RemovalCallback = Box<dyn FnOnce() + Send>;

/// The named membership table and addressing facade for one broadcast
/// target. Obtained from a [`GroupProvider`](crate::provider::GroupProvider).
pub struct Group<K: GroupKey> {
    name: Arc<str>,
    membership: Arc<Membership<K>>,
    serializer: Arc<dyn Serializer>,
    pending: Arc<PendingInvocationRegistry>,
    remote: Option<RemoteLink>,
    state: Mutex<GroupState>,
    on_removed: Mutex<Option<RemovalCallback>>,
    scope_ids: AtomicU64,
}

impl<K: GroupKey> Group<K> {
    pub(crate) fn new(
        name: Arc<str>,
        serializer: Arc<dyn Serializer>,
        pending: Arc<PendingInvocationRegistry>,
        remote: Option<RemoteLink>,
        on_removed: Option<RemovalCallback>,
    ) -> Self {
        Self {
            name,
            membership: Membership::new(),
            serializer,
            pending,
            remote,
            state: Mutex::new(GroupState {
                subscribed: false,
                subscription: None,
                disposed: false,
                next_unkeyed_id: 0,
            }),
            on_removed: Mutex::new(on_removed),
            scope_ids: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current membership size, keyed and unkeyed registrations combined.
    pub fn count(&self) -> usize {
        self.membership.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.membership.get(key).is_some()
    }

    /// The request/response correlation registry owned by this group.
    /// Hosts resolve inbound results through it.
    pub fn pending(&self) -> &Arc<PendingInvocationRegistry> {
        &self.pending
    }

    /// Registers `receiver` under `key`, subscribing to the backplane when
    /// membership leaves zero. Awaits subscription readiness.
    pub async fn add(&self, key: K, receiver: ReceiverHandle) -> Result<(), Error> {
        let ready = self.add_keyed(key, receiver)?;
        self.await_ready(ready).await
    }

    /// Synchronous form of [`Group::add`]: triggers the same transitions
    /// without awaiting subscription I/O.
    pub fn add_sync(&self, key: K, receiver: ReceiverHandle) -> Result<(), Error> {
        self.add_keyed(key, receiver).map(drop)
    }

    /// Registers a receiver without a key. Unkeyed receivers cannot be
    /// excluded or targeted; they are skipped whenever a call carries an
    /// explicit target set. Returns the registration id used for removal.
    pub async fn add_unkeyed(&self, receiver: ReceiverHandle) -> Result<u64, Error> {
        let (id, ready) = self.add_unkeyed_inner(receiver)?;
        self.await_ready(ready).await?;
        Ok(id)
    }

    pub fn add_unkeyed_sync(&self, receiver: ReceiverHandle) -> Result<u64, Error> {
        self.add_unkeyed_inner(receiver).map(|(id, _)| id)
    }

    /// Removes the receiver registered under `key`, unsubscribing when
    /// membership reaches zero; waits for the receive loop to exit.
    /// Removing an absent key is a no-op.
    pub async fn remove(&self, key: &K) -> Result<(), Error> {
        if let Some(join) = self.remove_inner(key) {
            // abort is the expected exit for the loop
            let _ = join.await;
        }

        Ok(())
    }

    pub fn remove_sync(&self, key: &K) -> Result<(), Error> {
        self.remove_inner(key);
        Ok(())
    }

    pub async fn remove_unkeyed(&self, id: u64) -> Result<(), Error> {
        if let Some(join) = self.remove_unkeyed_inner(id) {
            let _ = join.await;
        }

        Ok(())
    }

    pub fn remove_unkeyed_sync(&self, id: u64) -> Result<(), Error> {
        self.remove_unkeyed_inner(id);
        Ok(())
    }

    /// Broadcast facade over every member.
    pub fn all(&self) -> Multicaster<K> {
        self.caster(TargetSelector::All)
    }

    /// Broadcast facade over every member except `excludes`.
    pub fn except(&self, excludes: impl IntoIterator<Item = K>) -> Multicaster<K> {
        self.caster(TargetSelector::Except(excludes.into_iter().collect()))
    }

    /// Broadcast facade over the given members only.
    pub fn only(&self, targets: impl IntoIterator<Item = K>) -> Multicaster<K> {
        self.caster(TargetSelector::Only(targets.into_iter().collect()))
    }

    /// Facade addressing exactly one member; the only facade permitted to
    /// issue request/response calls.
    pub fn single(&self, target: K) -> Multicaster<K> {
        self.caster(TargetSelector::Single(target))
    }

    /// Idempotent. Forces unsubscribe regardless of membership, cancels
    /// outstanding request/response calls and removes this group from its
    /// provider. The instance cannot be reused afterwards.
    pub async fn dispose(&self) {
        let (join, callback) = self.dispose_inner();

        if let Some(join) = join {
            let _ = join.await;
        }

        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn dispose_sync(&self) {
        let (_join, callback) = self.dispose_inner();

        if let Some(callback) = callback {
            callback();
        }
    }

    pub(crate) fn leg(&self) -> Leg<K> {
        Leg {
            membership: self.membership.clone(),
            pending: self.pending.clone(),
            remote: self.remote.clone(),
        }
    }

    fn caster(&self, selector: TargetSelector<K>) -> Multicaster<K> {
        Multicaster::new(selector, self.serializer.clone(), smallvec![self.leg()])
    }

    fn add_keyed(&self, key: K, receiver: ReceiverHandle) -> Result<Option<ScopeReady>, Error> {
        if self.remote.is_some() && !receiver.is_remote_capable() {
            return Err(Error::NotRemoteCapable);
        }

        let mut st = self.state.lock();
        if st.disposed {
            return Err(Error::GroupDisposed);
        }

        self.membership.insert(key, receiver);

        Ok(self.maybe_subscribe_locked(&mut st))
    }

    fn add_unkeyed_inner(
        &self,
        receiver: ReceiverHandle,
    ) -> Result<(u64, Option<ScopeReady>), Error> {
        if self.remote.is_some() && !receiver.is_remote_capable() {
            return Err(Error::NotRemoteCapable);
        }

        let mut st = self.state.lock();
        if st.disposed {
            return Err(Error::GroupDisposed);
        }

        st.next_unkeyed_id += 1;
        let id = st.next_unkeyed_id;
        self.membership.insert_unkeyed(id, receiver);

        let ready = self.maybe_subscribe_locked(&mut st);
        Ok((id, ready))
    }

    fn remove_inner(&self, key: &K) -> Option<JoinHandle<()>> {
        let mut st = self.state.lock();
        if st.disposed || !self.membership.remove(key) {
            return None;
        }

        self.maybe_unsubscribe_locked(&mut st)
    }

    fn remove_unkeyed_inner(&self, id: u64) -> Option<JoinHandle<()>> {
        let mut st = self.state.lock();
        if st.disposed || !self.membership.remove_unkeyed(id) {
            return None;
        }

        self.maybe_unsubscribe_locked(&mut st)
    }

    fn dispose_inner(&self) -> (Option<JoinHandle<()>>, Option<RemovalCallback>) {
        let join = {
            let mut st = self.state.lock();
            if st.disposed {
                return (None, None);
            }

            st.disposed = true;
            st.subscribed = false;
            st.subscription.take().map(|scope| {
                scope.abort.abort();
                scope.join
            })
        };

        self.membership.clear();
        self.pending.dispose();

        log::debug!("group '{}': disposed", self.name);

        (join, self.on_removed.lock().take())
    }

    /// Subscribes whenever the group holds members but no live
    /// subscription; keeps the 0↔non-zero transitions exactly-once under
    /// the state lock.
    fn maybe_subscribe_locked(&self, st: &mut GroupState) -> Option<ScopeReady> {
        if st.subscribed || self.membership.len() == 0 {
            return None;
        }

        st.subscribed = true;

        let link = match &self.remote {
            Some(link) => link.clone(),
            None => return None,
        };

        // replace the cancellation scope before the new loop starts so two
        // receive loops for one channel never run concurrently
        if let Some(old) = st.subscription.take() {
            old.abort.abort();
        }

        let id = self.scope_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (abort, abort_reg) = AbortHandle::new_pair();

        let membership = self.membership.clone();
        let serializer = self.serializer.clone();
        let name = self.name.clone();

        let receive_loop = async move {
            let stream = match link.backplane.subscribe(&link.channel).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    log::error!(
                        "group '{}': subscribe to '{}' failed: {}",
                        name,
                        link.channel,
                        err
                    );
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            log::debug!("group '{}': receive loop started on '{}'", name, link.channel);

            futures::pin_mut!(stream);
            while let Some(bytes) = stream.next().await {
                fan_out_envelope(&membership, bytes, &*serializer, &name);
            }

            log::debug!("group '{}': receive loop ended", name);
        };

        let join = tokio::spawn(async move {
            let _ = Abortable::new(receive_loop, abort_reg).await;
        });

        st.subscription = Some(StoredScope { id, abort, join });

        Some(ScopeReady { id, rx: ready_rx })
    }

    fn maybe_unsubscribe_locked(&self, st: &mut GroupState) -> Option<JoinHandle<()>> {
        if !st.subscribed || self.membership.len() > 0 {
            return None;
        }

        st.subscribed = false;

        st.subscription.take().map(|scope| {
            scope.abort.abort();
            scope.join
        })
    }

    async fn await_ready(&self, ready: Option<ScopeReady>) -> Result<(), Error> {
        let ready = match ready {
            Some(ready) => ready,
            None => return Ok(()),
        };

        match ready.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.clear_failed_scope(ready.id);
                Err(err)
            }
            Err(_) => {
                self.clear_failed_scope(ready.id);
                Err(Error::Backplane(
                    "subscription ended before becoming ready".into(),
                ))
            }
        }
    }

    /// A failed subscribe leaves the group unsubscribed so the next add
    /// retries it.
    fn clear_failed_scope(&self, id: u64) {
        let mut st = self.state.lock();

        if st.subscription.as_ref().map(|scope| scope.id) == Some(id) {
            st.subscription = None;
            st.subscribed = false;
        }
    }
}

/// Decodes one inbound envelope and fans the payload out to every locally
/// registered receiver the envelope admits. Unkeyed receivers bypass the
/// exclude list but are skipped when an explicit target set is present.
fn fan_out_envelope<K: GroupKey>(
    membership: &Membership<K>,
    bytes: Bytes,
    serializer: &dyn Serializer,
    group: &str,
) {
    let envelope = match Envelope::<K>::decode(bytes, serializer) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("group '{}': dropping undecodable envelope: {}", group, err);
            return;
        }
    };

    for (key, handle) in membership.keyed().iter() {
        if !envelope.admits(key) {
            continue;
        }

        deliver(handle, &envelope.payload, group);
    }

    if envelope.targets.is_none() {
        for handle in membership.unkeyed().values() {
            deliver(handle, &envelope.payload, group);
        }
    }
}

fn deliver(handle: &ReceiverHandle, payload: &Bytes, group: &str) {
    let res = match handle {
        ReceiverHandle::Remote(writer) => writer.write(payload.clone()),
        ReceiverHandle::Local(receiver) => Invocation::decode(payload.clone())
            .and_then(|invocation| receiver.on_invocation(&invocation)),
    };

    if let Err(err) = res {
        log::warn!("group '{}': receiver delivery failed: {}", group, err);
    }
}

/// Facade over a shared [`Group`] exposing only the synchronous membership
/// forms. Obtained from
/// [`GroupProvider::get_or_add_synchronous_group`](crate::provider::GroupProvider::get_or_add_synchronous_group).
#[derive(Clone)]
pub struct SyncGroup<K: GroupKey> {
    inner: Arc<Group<K>>,
}

impl<K: GroupKey> SyncGroup<K> {
    pub(crate) fn new(inner: Arc<Group<K>>) -> Self {
        Self { inner }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn add(&self, key: K, receiver: ReceiverHandle) -> Result<(), Error> {
        self.inner.add_sync(key, receiver)
    }

    pub fn remove(&self, key: &K) -> Result<(), Error> {
        self.inner.remove_sync(key)
    }

    pub fn add_unkeyed(&self, receiver: ReceiverHandle) -> Result<u64, Error> {
        self.inner.add_unkeyed_sync(receiver)
    }

    pub fn remove_unkeyed(&self, id: u64) -> Result<(), Error> {
        self.inner.remove_unkeyed_sync(id)
    }

    pub fn count(&self) -> usize {
        self.inner.count()
    }

    pub fn all(&self) -> Multicaster<K> {
        self.inner.all()
    }

    pub fn except(&self, excludes: impl IntoIterator<Item = K>) -> Multicaster<K> {
        self.inner.except(excludes)
    }

    pub fn only(&self, targets: impl IntoIterator<Item = K>) -> Multicaster<K> {
        self.inner.only(targets)
    }

    pub fn single(&self, target: K) -> Multicaster<K> {
        self.inner.single(target)
    }

    pub fn dispose(&self) {
        self.inner.dispose_sync()
    }

    /// The shared asynchronous group behind this facade.
    pub fn inner(&self) -> &Arc<Group<K>> {
        &self.inner
    }
}
