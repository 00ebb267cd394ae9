//! One logical group serving both in-process and backplane-reachable
//! receivers. Remote-capable receivers land in the remote sub-group,
//! everything else in the local sub-group; the facades fan out over both.

use std::sync::Arc;

use smallvec::smallvec;

use crate::error::Error;
use crate::group::{Group, GroupKey};
use crate::proxy::{Multicaster, TargetSelector};
use crate::receiver::ReceiverHandle;
use crate::serializer::Serializer;

pub struct CompositeGroup<K: GroupKey> {
    local: Arc<Group<K>>,
    remote: Arc<Group<K>>,
    serializer: Arc<dyn Serializer>,
    on_removed: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<K: GroupKey> CompositeGroup<K> {
    pub(crate) fn new(
        local: Arc<Group<K>>,
        remote: Arc<Group<K>>,
        serializer: Arc<dyn Serializer>,
        on_removed: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            local,
            remote,
            serializer,
            on_removed: parking_lot::Mutex::new(on_removed),
        }
    }

    /// Routes on remote capability: receivers that can supply a direct
    /// write sink join the remote sub-group, the rest stay local.
    pub async fn add(&self, key: K, receiver: ReceiverHandle) -> Result<(), Error> {
        if receiver.is_remote_capable() {
            self.remote.add(key, receiver).await
        } else {
            self.local.add(key, receiver).await
        }
    }

    /// Removes from both sub-groups; a no-op on the one that never held
    /// the key.
    pub async fn remove(&self, key: &K) -> Result<(), Error> {
        self.local.remove(key).await?;
        self.remote.remove(key).await
    }

    pub fn count(&self) -> usize {
        self.local.count() + self.remote.count()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.local.contains(key) || self.remote.contains(key)
    }

    pub fn local(&self) -> &Arc<Group<K>> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<Group<K>> {
        &self.remote
    }

    pub fn all(&self) -> Multicaster<K> {
        self.caster(TargetSelector::All)
    }

    pub fn except(&self, excludes: impl IntoIterator<Item = K>) -> Multicaster<K> {
        self.caster(TargetSelector::Except(excludes.into_iter().collect()))
    }

    pub fn only(&self, targets: impl IntoIterator<Item = K>) -> Multicaster<K> {
        self.caster(TargetSelector::Only(targets.into_iter().collect()))
    }

    pub fn single(&self, target: K) -> Multicaster<K> {
        self.caster(TargetSelector::Single(target))
    }

    pub async fn dispose(&self) {
        self.local.dispose().await;
        self.remote.dispose().await;

        if let Some(callback) = self.on_removed.lock().take() {
            callback();
        }
    }

    fn caster(&self, selector: TargetSelector<K>) -> Multicaster<K> {
        Multicaster::new(
            selector,
            self.serializer.clone(),
            smallvec![self.local.leg(), self.remote.leg()],
        )
    }
}
