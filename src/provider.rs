//! The idempotent group cache and its construction wiring.
//!
//! The provider holds the serializer, optional backplane, timeout default
//! and channel naming, so groups get explicit dependencies instead of
//! global state. Lookups construct once on miss: concurrent calls for the
//! same name observe exactly one winning instance.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::backplane::Backplane;
use crate::composite::CompositeGroup;
use crate::error::Error;
use crate::group::{Group, GroupKey, RemoteLink, SyncGroup};
use crate::pending::PendingInvocationRegistry;
use crate::serializer::{MessagePackSerializer, Serializer};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHANNEL_PREFIX: &str = "groupcast.group.";

pub struct GroupProviderBuilder {
    serializer: Arc<dyn Serializer>,
    backplane: Option<Arc<dyn Backplane>>,
    default_timeout: Duration,
    channel_prefix: String,
}

impl Default for GroupProviderBuilder {
    fn default() -> Self {
        Self {
            serializer: Arc::new(MessagePackSerializer),
            backplane: None,
            default_timeout: DEFAULT_TIMEOUT,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

impl GroupProviderBuilder {
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Backs every group created by this provider with the given
    /// distributed pub/sub transport.
    pub fn backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Timeout substituted for request/response calls that do not carry
    /// their own.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Channel names are `prefix + group name`, stable across every
    /// process sharing the backplane.
    pub fn channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    pub fn build(self) -> GroupProvider {
        GroupProvider {
            groups: Arc::new(DashMap::new()),
            serializer: self.serializer,
            backplane: self.backplane,
            default_timeout: self.default_timeout,
            channel_prefix: self.channel_prefix.into(),
            instance_ids: AtomicU64::new(0),
        }
    }
}

struct GroupEntry {
    key_type: TypeId,
    instance: u64,
    group: Arc<dyn Any + Send + Sync>,
}

pub struct GroupProvider {
    groups: Arc<DashMap<String, GroupEntry>>,
    serializer: Arc<dyn Serializer>,
    backplane: Option<Arc<dyn Backplane>>,
    default_timeout: Duration,
    channel_prefix: Arc<str>,
    instance_ids: AtomicU64,
}

impl GroupProvider {
    pub fn builder() -> GroupProviderBuilder {
        GroupProviderBuilder::default()
    }

    /// Looks up or creates the group registered under `name`. Fails when
    /// the name is already taken by a group with a different key type or
    /// group kind.
    pub fn get_or_add_group<K: GroupKey>(&self, name: &str) -> Result<Arc<Group<K>>, Error> {
        let group = {
            let entry = self.groups.entry(name.to_string()).or_insert_with(|| {
                let instance = self.next_instance();
                let group: Arc<Group<K>> = Arc::new(self.make_group(name, instance));

                log::debug!("group '{}' created (instance {})", name, instance);

                GroupEntry {
                    key_type: TypeId::of::<K>(),
                    instance,
                    group,
                }
            });

            if entry.key_type != TypeId::of::<K>() {
                return Err(Error::GroupTypeMismatch(name.to_string()));
            }

            entry.group.clone()
        };

        group
            .downcast::<Group<K>>()
            .map_err(|_| Error::GroupTypeMismatch(name.to_string()))
    }

    /// Same cache entry as [`GroupProvider::get_or_add_group`], behind a
    /// facade exposing only the synchronous membership forms.
    pub fn get_or_add_synchronous_group<K: GroupKey>(
        &self,
        name: &str,
    ) -> Result<SyncGroup<K>, Error> {
        Ok(SyncGroup::new(self.get_or_add_group(name)?))
    }

    /// Looks up or creates a composite local+remote group. Requires a
    /// backplane.
    pub fn get_or_add_composite_group<K: GroupKey>(
        &self,
        name: &str,
    ) -> Result<Arc<CompositeGroup<K>>, Error> {
        let link = self.remote_link(name).ok_or(Error::NoBackplane)?;

        let group = {
            let entry = self.groups.entry(name.to_string()).or_insert_with(|| {
                let instance = self.next_instance();

                let local = Arc::new(Group::<K>::new(
                    name.into(),
                    self.serializer.clone(),
                    PendingInvocationRegistry::new(self.default_timeout),
                    None,
                    None,
                ));

                let remote = Arc::new(Group::<K>::new(
                    name.into(),
                    self.serializer.clone(),
                    PendingInvocationRegistry::new(self.default_timeout),
                    Some(link.clone()),
                    None,
                ));

                let group: Arc<CompositeGroup<K>> = Arc::new(CompositeGroup::new(
                    local,
                    remote,
                    self.serializer.clone(),
                    Some(self.removal_callback(name, instance)),
                ));

                log::debug!("composite group '{}' created (instance {})", name, instance);

                GroupEntry {
                    key_type: TypeId::of::<K>(),
                    instance,
                    group,
                }
            });

            if entry.key_type != TypeId::of::<K>() {
                return Err(Error::GroupTypeMismatch(name.to_string()));
            }

            entry.group.clone()
        };

        group
            .downcast::<CompositeGroup<K>>()
            .map_err(|_| Error::GroupTypeMismatch(name.to_string()))
    }

    /// Number of groups currently cached.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Channel a group of this name publishes and subscribes on.
    pub fn channel_name(&self, group: &str) -> String {
        format!("{}{}", self.channel_prefix, group)
    }

    fn make_group<K: GroupKey>(&self, name: &str, instance: u64) -> Group<K> {
        Group::new(
            name.into(),
            self.serializer.clone(),
            PendingInvocationRegistry::new(self.default_timeout),
            self.remote_link(name),
            Some(self.removal_callback(name, instance)),
        )
    }

    fn remote_link(&self, name: &str) -> Option<RemoteLink> {
        self.backplane.as_ref().map(|backplane| RemoteLink {
            backplane: backplane.clone(),
            channel: self.channel_name(name).into(),
        })
    }

    /// Each group deletes exactly its own cache entry on dispose; a newer
    /// group registered under the same name is left alone.
    fn removal_callback(&self, name: &str, instance: u64) -> Box<dyn FnOnce() + Send> {
        let groups = self.groups.clone();
        let name = name.to_string();

        Box::new(move || {
            if let Entry::Occupied(occupied) = groups.entry(name) {
                if occupied.get().instance == instance {
                    occupied.remove();
                }
            }
        })
    }

    fn next_instance(&self) -> u64 {
        self.instance_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_name_yields_same_instance() {
        let provider = GroupProvider::builder().build();

        let a = provider.get_or_add_group::<String>("room").unwrap();
        let b = provider.get_or_add_group::<String>("room").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.group_count(), 1);
    }

    #[tokio::test]
    async fn mismatched_key_type_is_a_usage_error() {
        let provider = GroupProvider::builder().build();

        provider.get_or_add_group::<String>("room").unwrap();

        assert!(matches!(
            provider.get_or_add_group::<u64>("room"),
            Err(Error::GroupTypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn composite_requires_backplane() {
        let provider = GroupProvider::builder().build();

        assert!(matches!(
            provider.get_or_add_composite_group::<String>("room"),
            Err(Error::NoBackplane)
        ));
    }

    #[test]
    fn channel_name_is_prefix_plus_group() {
        let provider = GroupProvider::builder().channel_prefix("app.").build();

        assert_eq!(provider.channel_name("room"), "app.room");
    }
}
