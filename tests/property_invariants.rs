use proptest::prelude::*;

use docsync::{
    config::SyncConfig,
    core::store::{RecordStore, SharedStore},
    document::DocKey,
    feed::memory::MemoryFeed,
    index::memory::MemoryIndex,
    persist::MemoryCheckpointStore,
    projector::{related::RelatedEntitySnapshot, Projection, Projector},
    record::{ContactRecord, EntityRecord, MessageRecord, RoomRecord},
    runtime::handle::{spawn_pipeline, PipelineDeps},
    types::{EntityRef, EntityType},
};

#[derive(Debug, Clone)]
enum Action {
    SetText { msg: u8, text: u8 },
    Delete { msg: u8 },
    RenameContact { name: u8 },
    Publish,
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => (0u8..4, 0u8..16).prop_map(|(msg, text)| Action::SetText { msg, text }),
        1 => (0u8..4).prop_map(|msg| Action::Delete { msg }),
        1 => (0u8..6).prop_map(|name| Action::RenameContact { name }),
        2 => Just(Action::Publish),
    ]
}

fn contact(name: u8) -> EntityRecord {
    EntityRecord::Contact(ContactRecord {
        id: "c1".to_string(),
        name: format!("Contact {name}"),
        ..ContactRecord::default()
    })
}

fn message(msg: u8, text: u8) -> EntityRecord {
    EntityRecord::Message(MessageRecord {
        id: format!("m{msg}"),
        room_id: "r1".to_string(),
        contact_id: Some("c1".to_string()),
        text: Some(format!("text {text}")),
        ..MessageRecord::default()
    })
}

fn seeded_store() -> RecordStore {
    let mut store = RecordStore::new();
    store.upsert(contact(0)).expect("contact");
    store
        .upsert(EntityRecord::Room(RoomRecord {
            id: "r1".to_string(),
            contact_id: Some("c1".to_string()),
            urn: "whatsapp:1".to_string(),
            is_active: true,
            ..RoomRecord::default()
        }))
        .expect("room");
    store
}

fn run_pipeline(actions: &[Action], batch_max_size: usize) -> (SharedStore, MemoryIndex) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    runtime.block_on(async {
        let store = seeded_store().into_shared();
        let feed = MemoryFeed::shared();
        let index = MemoryIndex::new();
        let config = SyncConfig {
            batch_max_size,
            batch_max_wait_ms: 1,
            poll_interval_ms: 5,
            ..SyncConfig::default()
        };
        let deps = PipelineDeps::new(
            feed.clone(),
            store.clone(),
            Box::new(index.clone()),
            Box::new(MemoryCheckpointStore::new()),
        );
        let handle = spawn_pipeline(config, deps).await.expect("spawn");

        for action in actions {
            match action {
                Action::SetText { msg, text } => {
                    store.write().upsert(message(*msg, *text)).expect("upsert");
                }
                Action::Delete { msg } => {
                    let id = format!("m{msg}");
                    let mut store = store.write();
                    if store.message(&id).is_some() {
                        store.delete(EntityType::Message, &id).expect("delete");
                    }
                }
                Action::RenameContact { name } => {
                    store.write().upsert(contact(*name)).expect("rename");
                }
                Action::Publish => {
                    let events = store.write().drain_pending_events();
                    feed.publish(events).expect("publish");
                    tokio::task::yield_now().await;
                }
            }
        }

        let events = store.write().drain_pending_events();
        feed.publish(events).expect("publish");
        feed.close();
        handle.join().await.expect("join");
        (store, index)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn index_converges_to_the_projection_of_the_final_store(
        actions in prop::collection::vec(action_strategy(), 1..40),
        batch_max_size in 1usize..6,
    ) {
        let (shared, index) = run_pipeline(&actions, batch_max_size);
        let store = shared.read();
        let projector = Projector::new();

        for msg in 0u8..4 {
            let id = format!("m{msg}");
            let key = DocKey::new(EntityType::Message, id.clone());
            match store.live(&EntityRef::new(EntityType::Message, id)) {
                Some(record) => {
                    let event = docsync::event::MutationEvent::update(0, 0, record.clone());
                    let related = RelatedEntitySnapshot::resolve(record, &*store);
                    let expected = match projector.project(&event, &related) {
                        Ok(Projection::Upsert(doc)) => doc,
                        other => panic!("unexpected projection {other:?}"),
                    };
                    prop_assert_eq!(index.get(&key), Some(expected));
                }
                None => prop_assert!(!index.contains(&key)),
            }
        }

        let contact_doc = index.get(&DocKey::new(EntityType::Contact, "c1"));
        let live_contact = store.contact("c1").cloned();
        prop_assert_eq!(contact_doc.is_some(), live_contact.is_some());
    }
}
