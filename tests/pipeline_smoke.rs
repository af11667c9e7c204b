use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{broadcast, watch};

use docsync::{
    config::SyncConfig,
    core::store::{RecordStore, SharedStore},
    document::{DocKey, DocumentBody, SearchDocument},
    event::MutationEvent,
    feed::{memory::MemoryFeed, FeedError, FeedResult, FeedSource},
    index::{
        memory::MemoryIndex,
        writer::{spawn_index_writer, WriterConfig},
        DocOutcome, IndexError, IndexOp, SearchIndex,
    },
    persist::{
        sqlite::{SqliteCheckpointStore, SqliteJournal},
        MemoryCheckpointStore,
    },
    record::{ContactRecord, EntityRecord, MessageRecord, RoomRecord},
    runtime::{
        events::{PipelineEvent, Stage},
        handle::{spawn_pipeline, PipelineDeps, PipelineHandle},
    },
    types::{EntityRef, EntityType, Offset, Operation},
};

fn fast_config() -> SyncConfig {
    SyncConfig {
        batch_max_wait_ms: 5,
        retry_base_ms: 10,
        retry_cap_ms: 40,
        poll_interval_ms: 10,
        ..SyncConfig::default()
    }
}

fn contact(id: &str, name: &str) -> EntityRecord {
    EntityRecord::Contact(ContactRecord {
        id: id.to_string(),
        name: name.to_string(),
        ..ContactRecord::default()
    })
}

fn room(id: &str, contact_id: &str) -> EntityRecord {
    EntityRecord::Room(RoomRecord {
        id: id.to_string(),
        contact_id: Some(contact_id.to_string()),
        urn: format!("whatsapp:{id}"),
        is_active: true,
        ..RoomRecord::default()
    })
}

fn message(id: &str, room_id: &str, contact_id: Option<&str>, text: &str) -> EntityRecord {
    EntityRecord::Message(MessageRecord {
        id: id.to_string(),
        room_id: room_id.to_string(),
        contact_id: contact_id.map(str::to_string),
        text: Some(text.to_string()),
        ..MessageRecord::default()
    })
}

struct Harness {
    store: SharedStore,
    feed: Arc<MemoryFeed>,
    index: MemoryIndex,
    checkpoints: MemoryCheckpointStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: RecordStore::new().into_shared(),
            feed: MemoryFeed::shared(),
            index: MemoryIndex::new(),
            checkpoints: MemoryCheckpointStore::new(),
        }
    }

    fn upsert(&self, record: EntityRecord) {
        self.store.write().upsert(record).expect("upsert");
    }

    fn delete(&self, entity_type: EntityType, id: &str) {
        self.store.write().delete(entity_type, id).expect("delete");
    }

    fn publish(&self) {
        let events = self.store.write().drain_pending_events();
        self.feed.publish(events).expect("publish");
    }

    fn deps_with(&self, index: Box<dyn SearchIndex>) -> PipelineDeps {
        PipelineDeps::new(
            self.feed.clone(),
            self.store.clone(),
            index,
            Box::new(self.checkpoints.clone()),
        )
    }

    async fn spawn(&self, config: SyncConfig) -> PipelineHandle {
        spawn_pipeline(config, self.deps_with(Box::new(self.index.clone())))
            .await
            .expect("spawn pipeline")
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    mut pred: impl FnMut(&PipelineEvent) -> bool,
) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(evt) if pred(&evt) => return evt,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event in time")
}

fn checkpoint_reached(entity_type: EntityType, offset: Offset) -> impl FnMut(&PipelineEvent) -> bool {
    move |evt| {
        matches!(evt, PipelineEvent::CheckpointAdvanced { entity_type: et, offset: o } if *et == entity_type && *o >= offset)
    }
}

fn message_text(doc: &SearchDocument) -> Option<String> {
    match &doc.body {
        DocumentBody::Message(body) => body.text.clone(),
        _ => None,
    }
}

#[tokio::test]
async fn updated_message_ends_with_latest_text_and_checkpoint() {
    let h = Harness::new();
    h.upsert(contact("c1", "Ana"));
    h.upsert(room("r1", "c1"));
    h.publish();

    let handle = h.spawn(fast_config()).await;

    h.upsert(message("m1", "r1", Some("c1"), "hi"));
    h.publish();
    h.upsert(message("m1", "r1", Some("c1"), "hi there"));
    h.publish();
    h.feed.close();
    handle.join().await.expect("join");

    let doc = h
        .index
        .get(&DocKey::new(EntityType::Message, "m1"))
        .expect("message indexed");
    assert_eq!(message_text(&doc).as_deref(), Some("hi there"));
    assert_eq!(h.checkpoints.get(EntityType::Message), Some(2));
    assert_eq!(h.checkpoints.get(EntityType::Room), Some(1));
    assert_eq!(h.checkpoints.get(EntityType::Contact), Some(1));
    assert_eq!(h.checkpoints.get(EntityType::User), None);
}

#[tokio::test]
async fn restart_resumes_after_the_durable_checkpoint() {
    let h = Harness::new();
    let handle = h.spawn(fast_config()).await;
    let mut events = handle.subscribe();

    h.upsert(contact("c1", "Ana"));
    h.upsert(contact("c2", "Bia"));
    h.publish();
    wait_for(&mut events, checkpoint_reached(EntityType::Contact, 2)).await;
    assert_eq!(handle.checkpoint(EntityType::Contact), 2);
    handle.shutdown().await.expect("shutdown");
    assert_eq!(h.checkpoints.get(EntityType::Contact), Some(2));

    h.upsert(contact("c3", "Caio"));
    h.publish();
    h.feed.close();

    let second_index = MemoryIndex::new();
    let handle = spawn_pipeline(fast_config(), h.deps_with(Box::new(second_index.clone())))
        .await
        .expect("respawn");
    assert_eq!(handle.checkpoint(EntityType::Contact), 2);
    handle.join().await.expect("join");

    assert_eq!(second_index.len(), 1);
    assert!(second_index.contains(&DocKey::new(EntityType::Contact, "c3")));
    assert_eq!(h.checkpoints.get(EntityType::Contact), Some(3));
}

struct FlakyIndex {
    inner: MemoryIndex,
    failures_left: Arc<AtomicUsize>,
}

impl FlakyIndex {
    fn fail(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SearchIndex for FlakyIndex {
    fn upsert(&mut self, doc: &SearchDocument) -> Result<DocOutcome, IndexError> {
        self.inner.upsert(doc)
    }

    fn delete(&mut self, key: &DocKey) -> Result<DocOutcome, IndexError> {
        self.inner.delete(key)
    }

    fn bulk(&mut self, ops: &[IndexOp]) -> Result<Vec<DocOutcome>, IndexError> {
        if self.fail() {
            return Err(IndexError::Unavailable("connection refused".to_string()));
        }
        self.inner.bulk(ops)
    }
}

#[tokio::test]
async fn index_outage_is_retried_until_the_write_lands() {
    let h = Harness::new();
    let failures = Arc::new(AtomicUsize::new(3));
    let flaky = FlakyIndex {
        inner: h.index.clone(),
        failures_left: failures.clone(),
    };
    let handle = spawn_pipeline(fast_config(), h.deps_with(Box::new(flaky)))
        .await
        .expect("spawn");
    let mut events = handle.subscribe();

    h.upsert(contact("c1", "Ana"));
    h.publish();

    let mut attempts = Vec::new();
    while attempts.len() < 3 {
        let evt = wait_for(&mut events, |e| matches!(e, PipelineEvent::Retrying { .. })).await;
        if let PipelineEvent::Retrying { stage, attempt, .. } = evt {
            assert_eq!(stage, Stage::Index);
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, vec![0, 1, 2]);

    wait_for(&mut events, checkpoint_reached(EntityType::Contact, 1)).await;
    assert!(h.index.contains(&DocKey::new(EntityType::Contact, "c1")));
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    h.feed.close();
    handle.join().await.expect("join");
}

struct FlakyFeed {
    inner: Arc<MemoryFeed>,
    failures_left: AtomicUsize,
}

impl FeedSource for FlakyFeed {
    fn fetch_after(&self, entity_type: EntityType, after: Offset, limit: usize) -> FeedResult<Vec<MutationEvent>> {
        if entity_type == EntityType::Room
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(FeedError::Unavailable("broker restarting".to_string()));
        }
        self.inner.fetch_after(entity_type, after, limit)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn feed_outage_is_retried_without_losing_events() {
    let h = Harness::new();
    h.upsert(contact("c1", "Ana"));
    h.upsert(room("r1", "c1"));
    h.upsert(room("r2", "c1"));
    h.publish();
    h.feed.close();

    let feed = Arc::new(FlakyFeed {
        inner: h.feed.clone(),
        failures_left: AtomicUsize::new(2),
    });
    let deps = PipelineDeps::new(
        feed,
        h.store.clone(),
        Box::new(h.index.clone()),
        Box::new(h.checkpoints.clone()),
    );
    let handle = spawn_pipeline(fast_config(), deps).await.expect("spawn");
    let mut events = handle.subscribe();

    let retry = wait_for(&mut events, |e| matches!(e, PipelineEvent::Retrying { .. })).await;
    assert!(matches!(
        retry,
        PipelineEvent::Retrying {
            entity_type: EntityType::Room,
            stage: Stage::Feed,
            ..
        }
    ));
    handle.join().await.expect("join");

    assert_eq!(h.index.documents(EntityType::Room).len(), 2);
    assert_eq!(h.checkpoints.get(EntityType::Room), Some(2));
}

#[tokio::test]
async fn rejected_events_are_reported_and_skipped() {
    let h = Harness::new();
    let long_text = "x".repeat(500);
    let mut bad_contact = MutationEvent::delete(1, 0, EntityRef::new(EntityType::Contact, "c9"));
    bad_contact.op = Operation::Update;
    h.feed
        .publish(vec![
            bad_contact,
            MutationEvent::create(2, 0, contact("c1", "Ana")),
            MutationEvent::create(1, 0, message("m1", "r1", None, "ok")),
            MutationEvent::create(2, 0, message("m2", "r1", None, &long_text)),
        ])
        .expect("publish");
    h.feed.close();

    let index = MemoryIndex::new().with_max_doc_bytes(300);
    let handle = spawn_pipeline(fast_config(), h.deps_with(Box::new(index.clone())))
        .await
        .expect("spawn");
    let mut events = handle.subscribe();

    let mut rejected = Vec::new();
    while rejected.len() < 2 {
        if let PipelineEvent::Rejected {
            entity_type,
            offset,
            entity_id,
            ..
        } = wait_for(&mut events, |e| matches!(e, PipelineEvent::Rejected { .. })).await
        {
            rejected.push((entity_type, offset, entity_id));
        }
    }
    rejected.sort();
    assert_eq!(
        rejected,
        vec![
            (EntityType::Message, 2, "m2".to_string()),
            (EntityType::Contact, 1, "c9".to_string()),
        ]
    );
    handle.join().await.expect("join");

    assert!(index.contains(&DocKey::new(EntityType::Message, "m1")));
    assert!(!index.contains(&DocKey::new(EntityType::Message, "m2")));
    assert!(index.contains(&DocKey::new(EntityType::Contact, "c1")));
    assert_eq!(h.checkpoints.get(EntityType::Message), Some(2));
    assert_eq!(h.checkpoints.get(EntityType::Contact), Some(2));
}

struct DownIndex;

impl SearchIndex for DownIndex {
    fn upsert(&mut self, _doc: &SearchDocument) -> Result<DocOutcome, IndexError> {
        Err(IndexError::Unavailable("down".to_string()))
    }

    fn delete(&mut self, _key: &DocKey) -> Result<DocOutcome, IndexError> {
        Err(IndexError::Unavailable("down".to_string()))
    }
}

#[tokio::test]
async fn shutdown_interrupts_a_backoff_and_keeps_the_checkpoint() {
    let h = Harness::new();
    let config = SyncConfig {
        retry_base_ms: 10_000,
        retry_cap_ms: 10_000,
        ..fast_config()
    };
    let handle = spawn_pipeline(config, h.deps_with(Box::new(DownIndex)))
        .await
        .expect("spawn");
    let mut events = handle.subscribe();

    h.upsert(contact("c1", "Ana"));
    h.publish();
    wait_for(&mut events, |e| matches!(e, PipelineEvent::Retrying { .. })).await;

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("shutdown does not wait out the backoff")
        .expect("shutdown");
    assert_eq!(h.checkpoints.get(EntityType::Contact), None);
}

#[tokio::test]
async fn workers_report_their_checkpoint_when_stopping() {
    let h = Harness::new();
    let config = SyncConfig {
        entity_types: vec![EntityType::Contact],
        ..fast_config()
    };
    let handle = h.spawn(config).await;
    let mut events = handle.subscribe();

    h.upsert(contact("c1", "Ana"));
    h.publish();
    wait_for(&mut events, checkpoint_reached(EntityType::Contact, 1)).await;
    handle.shutdown().await.expect("shutdown");

    let stopped = wait_for(&mut events, |e| matches!(e, PipelineEvent::WorkerStopped { .. })).await;
    assert_eq!(
        stopped,
        PipelineEvent::WorkerStopped {
            entity_type: EntityType::Contact,
            checkpoint: 1,
        }
    );
}

#[tokio::test]
async fn rename_and_room_delete_reach_every_embedding_document() {
    let h = Harness::new();
    let handle = h.spawn(fast_config()).await;

    h.upsert(contact("c1", "Ana"));
    h.upsert(room("r1", "c1"));
    h.upsert(room("r2", "c1"));
    h.upsert(message("m1", "r1", Some("c1"), "first"));
    h.upsert(message("m2", "r2", Some("c1"), "second"));
    h.publish();

    h.upsert(contact("c1", "Ana Maria"));
    h.publish();
    h.delete(EntityType::Room, "r1");
    h.publish();
    h.feed.close();
    handle.join().await.expect("join");

    assert!(!h.index.contains(&DocKey::new(EntityType::Room, "r1")));
    assert!(!h.index.contains(&DocKey::new(EntityType::Message, "m1")));

    let m2 = h
        .index
        .get(&DocKey::new(EntityType::Message, "m2"))
        .expect("m2 indexed");
    let DocumentBody::Message(body) = m2.body else {
        panic!("expected message body");
    };
    assert_eq!(body.contact.map(|c| c.name).as_deref(), Some("Ana Maria"));
    assert_eq!(body.room.and_then(|r| r.contact).as_deref(), Some("Ana Maria"));

    let r2 = h
        .index
        .get(&DocKey::new(EntityType::Room, "r2"))
        .expect("r2 indexed");
    let DocumentBody::Room(body) = r2.body else {
        panic!("expected room body");
    };
    assert_eq!(body.contact.map(|c| c.name).as_deref(), Some("Ana Maria"));
}

#[tokio::test]
async fn writer_batches_callers_and_answers_each_one() {
    let index = MemoryIndex::new();
    let writer = spawn_index_writer(
        Box::new(index.clone()),
        WriterConfig {
            batch_max_size: 4,
            batch_max_wait: Duration::from_millis(20),
            queue_bound: 16,
        },
    );

    let mut tasks = Vec::new();
    for i in 0..10 {
        let writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            let doc = SearchDocument {
                key: DocKey::new(EntityType::Contact, format!("c{i}")),
                body: DocumentBody::Contact(docsync::document::ContactDocument {
                    name: format!("Contact {i}"),
                    email: None,
                    phone: String::new(),
                    status: String::new(),
                    external_id: None,
                }),
            };
            writer.apply(IndexOp::Upsert(doc)).await
        }));
    }
    for task in tasks {
        let ack = task.await.expect("join").expect("apply");
        assert_eq!(ack.key.index, EntityType::Contact);
    }

    assert_eq!(index.len(), 10);
    assert!(index.bulk_calls() < 10);

    let outcomes = writer
        .apply_batch(vec![
            IndexOp::Delete(DocKey::new(EntityType::Contact, "c0")),
            IndexOp::Delete(DocKey::new(EntityType::Contact, "missing")),
        ])
        .await
        .expect("batch");
    assert_eq!(outcomes, vec![DocOutcome::Applied, DocOutcome::Applied]);
    assert_eq!(index.len(), 9);

    writer.shutdown().await.expect("shutdown");
    assert!(matches!(
        writer.apply(IndexOp::Delete(DocKey::new(EntityType::Contact, "c1"))).await,
        Err(IndexError::ChannelClosed)
    ));
}

#[tokio::test]
async fn writer_reports_refused_documents_per_caller() {
    let index = MemoryIndex::new().with_max_doc_bytes(10);
    let writer = spawn_index_writer(Box::new(index.clone()), WriterConfig::default());
    let key = DocKey::new(EntityType::Contact, "c1");
    let doc = SearchDocument {
        key: key.clone(),
        body: DocumentBody::Contact(docsync::document::ContactDocument {
            name: "Far too long for the limit".to_string(),
            email: None,
            phone: String::new(),
            status: String::new(),
            external_id: None,
        }),
    };

    let err = writer.apply(IndexOp::Upsert(doc)).await.expect_err("rejected");
    assert!(matches!(&err, IndexError::Rejected { key: k, .. } if *k == key));
    assert!(!err.is_transient());
    assert!(index.is_empty());
    writer.shutdown().await.expect("shutdown");
}

#[test]
fn reapplying_documents_and_tombstones_leaves_the_same_state() {
    let mut index = MemoryIndex::new();
    let key = DocKey::new(EntityType::Contact, "c1");
    let doc = SearchDocument {
        key: key.clone(),
        body: DocumentBody::Contact(docsync::document::ContactDocument {
            name: "Ana".to_string(),
            email: None,
            phone: String::new(),
            status: String::new(),
            external_id: None,
        }),
    };

    assert_eq!(index.upsert(&doc), Ok(DocOutcome::Applied));
    let once = index.documents(EntityType::Contact);
    assert_eq!(index.upsert(&doc), Ok(DocOutcome::Applied));
    assert_eq!(index.documents(EntityType::Contact), once);

    assert_eq!(index.delete(&key), Ok(DocOutcome::Applied));
    assert_eq!(index.delete(&key), Ok(DocOutcome::Applied));
    assert!(index.is_empty());
}

#[tokio::test]
async fn journal_fed_pipeline_persists_checkpoints_to_the_configured_file() {
    let tmp = tempfile::TempDir::new().expect("tmp");
    let journal = Arc::new(SqliteJournal::open(tmp.path().join("journal.db")).expect("journal"));
    let store = RecordStore::new().into_shared();
    {
        let mut store = store.write();
        store.upsert(contact("c1", "Ana")).expect("c1");
        store.upsert(room("r1", "c1")).expect("r1");
        journal
            .append_events(&store.drain_pending_events())
            .expect("append");
    }

    let checkpoint_path = tmp.path().join("checkpoints.db");
    let config = SyncConfig {
        checkpoint_store_location: Some(checkpoint_path.clone()),
        ..fast_config()
    };
    let index = MemoryIndex::new();
    let deps = PipelineDeps::with_configured_checkpoints(
        &config,
        journal.clone(),
        store.clone(),
        Box::new(index.clone()),
    )
    .expect("deps");
    let handle = spawn_pipeline(config, deps).await.expect("spawn");

    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.checkpoint(EntityType::Room) < 1 || handle.checkpoint(EntityType::Contact) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("journal drained");
    handle.shutdown().await.expect("shutdown");

    assert!(index.contains(&DocKey::new(EntityType::Room, "r1")));
    let checkpoints = SqliteCheckpointStore::open(&checkpoint_path).expect("reopen");
    assert_eq!(
        checkpoints.all().expect("all"),
        vec![(EntityType::Contact, 1), (EntityType::Room, 1)]
    );
}

#[tokio::test]
async fn undecodable_journal_rows_are_rejected_without_stalling_the_stream() {
    let tmp = tempfile::TempDir::new().expect("tmp");
    let db_path = tmp.path().join("journal.db");
    let journal = Arc::new(SqliteJournal::open(&db_path).expect("journal"));
    let store = RecordStore::new().into_shared();
    {
        let mut store = store.write();
        store.upsert(contact("c1", "Ana")).expect("c1");
        store.upsert(contact("c2", "Bia")).expect("c2");
        journal
            .append_events(&store.drain_pending_events())
            .expect("append");
    }
    rusqlite::Connection::open(&db_path)
        .expect("raw open")
        .execute(
            "UPDATE events SET payload = ?1 WHERE entity_type = ?2 AND seq = 1",
            rusqlite::params![b"{}".to_vec(), EntityType::Contact.as_str()],
        )
        .expect("corrupt row");

    let config = SyncConfig {
        entity_types: vec![EntityType::Contact],
        ..fast_config()
    };
    let index = MemoryIndex::new();
    let checkpoints = MemoryCheckpointStore::new();
    let deps = PipelineDeps::new(
        journal.clone(),
        store.clone(),
        Box::new(index.clone()),
        Box::new(checkpoints.clone()),
    );
    let handle = spawn_pipeline(config, deps).await.expect("spawn");
    let mut events = handle.subscribe();

    let rejected = wait_for(&mut events, |e| matches!(e, PipelineEvent::Rejected { .. })).await;
    assert!(matches!(
        rejected,
        PipelineEvent::Rejected { entity_type: EntityType::Contact, offset: 1, ref entity_id, .. } if entity_id == "c1"
    ));
    wait_for(&mut events, checkpoint_reached(EntityType::Contact, 2)).await;
    handle.shutdown().await.expect("shutdown");

    assert!(!index.contains(&DocKey::new(EntityType::Contact, "c1")));
    assert!(index.contains(&DocKey::new(EntityType::Contact, "c2")));
    assert_eq!(checkpoints.get(EntityType::Contact), Some(2));
}
