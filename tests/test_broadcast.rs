use std::sync::Arc;

use groupcast::{
    Error, GroupProvider, Invocation, LocalReceiver, MessagePackSerializer, ReceiverHandle,
    SerializationContext, Serializer,
};
use parking_lot::Mutex;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Invocation>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.calls.lock().len()
    }

    fn last_args<T: serde::de::DeserializeOwned>(&self) -> T {
        let calls = self.calls.lock();
        let invocation = calls.last().expect("no call recorded");

        let ctx = SerializationContext {
            method_name: "",
            method_id: invocation.method_id,
            message_id: invocation.message_id,
        };

        let serializer: &dyn Serializer = &MessagePackSerializer;
        serializer.decode_value(&invocation.args, &ctx).unwrap()
    }
}

impl LocalReceiver for Recorder {
    fn on_invocation(&self, invocation: &Invocation) -> Result<(), Error> {
        self.calls.lock().push(invocation.clone());
        Ok(())
    }
}

struct Faulty;

impl LocalReceiver for Faulty {
    fn on_invocation(&self, _invocation: &Invocation) -> Result<(), Error> {
        Err(Error::Remote("receiver blew up".into()))
    }
}

async fn group_with_members(
    names: &[&str],
) -> (
    Arc<groupcast::Group<String>>,
    Vec<Arc<Recorder>>,
    GroupProvider,
) {
    let provider = GroupProvider::builder().build();
    let group = provider.get_or_add_group::<String>("room").unwrap();

    let mut recorders = Vec::new();
    for name in names {
        let recorder = Arc::new(Recorder::default());
        group
            .add(name.to_string(), ReceiverHandle::Local(recorder.clone()))
            .await
            .unwrap();
        recorders.push(recorder);
    }

    (group, recorders, provider)
}

#[tokio::test]
async fn all_delivers_exactly_once_to_each_member() {
    let (group, recorders, _provider) = group_with_members(&["a", "b", "c"]).await;

    group.all().invoke("OnTick", &(42u32,)).await.unwrap();

    for recorder in &recorders {
        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.last_args::<(u32,)>(), (42,));
    }
}

#[tokio::test]
async fn except_skips_the_excluded_members() {
    let (group, recorders, _provider) = group_with_members(&["a", "b", "c"]).await;

    group
        .except(vec!["a".to_string()])
        .invoke("OnTick", &())
        .await
        .unwrap();

    assert_eq!(recorders[0].count(), 0);
    assert_eq!(recorders[1].count(), 1);
    assert_eq!(recorders[2].count(), 1);
}

#[tokio::test]
async fn only_delivers_to_the_listed_members() {
    let (group, recorders, _provider) = group_with_members(&["a", "b", "c"]).await;

    group
        .only(vec!["a".to_string(), "c".to_string()])
        .invoke("OnTick", &())
        .await
        .unwrap();

    assert_eq!(recorders[0].count(), 1);
    assert_eq!(recorders[1].count(), 0);
    assert_eq!(recorders[2].count(), 1);
}

#[tokio::test]
async fn single_delivers_to_one_member_only() {
    let (group, recorders, _provider) = group_with_members(&["a", "b", "c"]).await;

    group
        .single("a".to_string())
        .invoke("OnTick", &())
        .await
        .unwrap();

    assert_eq!(recorders[0].count(), 1);
    assert_eq!(recorders[1].count(), 0);
    assert_eq!(recorders[2].count(), 0);
}

#[tokio::test]
async fn single_unknown_key_delivers_to_nobody() {
    let (group, recorders, _provider) = group_with_members(&["a", "b"]).await;

    group
        .single("ghost".to_string())
        .invoke("OnTick", &())
        .await
        .unwrap();

    assert_eq!(recorders[0].count(), 0);
    assert_eq!(recorders[1].count(), 0);
}

#[tokio::test]
async fn faulting_receiver_does_not_block_siblings() {
    let provider = GroupProvider::builder().build();
    let group = provider.get_or_add_group::<String>("room").unwrap();

    let before = Arc::new(Recorder::default());
    let after = Arc::new(Recorder::default());

    group
        .add("a".to_string(), ReceiverHandle::Local(before.clone()))
        .await
        .unwrap();
    group
        .add("boom".to_string(), ReceiverHandle::local(Faulty))
        .await
        .unwrap();
    group
        .add("c".to_string(), ReceiverHandle::Local(after.clone()))
        .await
        .unwrap();

    group.all().invoke("OnTick", &()).await.unwrap();

    assert_eq!(before.count(), 1);
    assert_eq!(after.count(), 1);
}

#[tokio::test]
async fn unkeyed_receivers_bypass_excludes_but_not_targets() {
    let (group, recorders, _provider) = group_with_members(&["a"]).await;

    let unkeyed = Arc::new(Recorder::default());
    let id = group
        .add_unkeyed(ReceiverHandle::Local(unkeyed.clone()))
        .await
        .unwrap();

    assert_eq!(group.count(), 2);

    group.all().invoke("OnTick", &()).await.unwrap();
    assert_eq!(unkeyed.count(), 1);

    group
        .except(vec!["a".to_string()])
        .invoke("OnTick", &())
        .await
        .unwrap();
    assert_eq!(unkeyed.count(), 2);
    assert_eq!(recorders[0].count(), 1);

    group
        .only(vec!["a".to_string()])
        .invoke("OnTick", &())
        .await
        .unwrap();
    group
        .single("a".to_string())
        .invoke("OnTick", &())
        .await
        .unwrap();
    assert_eq!(unkeyed.count(), 2);

    group.remove_unkeyed(id).await.unwrap();
    assert_eq!(group.count(), 1);
}

#[tokio::test]
async fn facades_see_membership_changes_live() {
    let (group, recorders, _provider) = group_with_members(&["a"]).await;

    let all = group.all();
    all.invoke("OnTick", &()).await.unwrap();
    assert_eq!(recorders[0].count(), 1);

    let late = Arc::new(Recorder::default());
    group
        .add("late".to_string(), ReceiverHandle::Local(late.clone()))
        .await
        .unwrap();

    // the facade was obtained before the member joined
    all.invoke("OnTick", &()).await.unwrap();
    assert_eq!(recorders[0].count(), 2);
    assert_eq!(late.count(), 1);
}
