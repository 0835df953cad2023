//! End-to-end notification flow over the mock bus.
//!
//! Wires the full consumer path: envelopes delivered through the bus and
//! dispatcher into the aggregation service, rows in the in-memory store,
//! and push frames on live connections.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use herald::bus::{
    Dispatcher, EventBus, EventPublisher, MockEventBus, PublishOutcome,
};
use herald::envelope::{event_type, exchange, EventEnvelope};
use herald::notify::{
    MemoryNotificationStore, NewNotification, NotificationService, NotificationStore,
    NotificationType,
};
use herald::realtime::{ConnectionRegistry, StaticTokenVerifier};

struct Fabric {
    bus: Arc<MockEventBus>,
    service: Arc<NotificationService>,
    store: Arc<MemoryNotificationStore>,
    registry: Arc<ConnectionRegistry>,
}

/// Full consumer wiring over the mock bus.
async fn fabric() -> Fabric {
    let store = Arc::new(MemoryNotificationStore::new());
    let verifier = StaticTokenVerifier::new()
        .with_token("tok-u1", "u1")
        .with_token("tok-u2", "u2");
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(verifier)));
    let service = Arc::new(NotificationService::new(
        Arc::clone(&store) as Arc<dyn NotificationStore>,
        Arc::clone(&registry),
    ));

    let mut dispatcher = Dispatcher::new();
    service.register_handlers(&mut dispatcher);

    let bus = Arc::new(MockEventBus::new());
    bus.subscribe(Arc::new(dispatcher)).await.unwrap();
    bus.start_consuming().await.unwrap();

    Fabric {
        bus,
        service,
        store,
        registry,
    }
}

async fn connect(fabric: &Fabric, token: &str) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    fabric.registry.connect(token, tx).await.unwrap();
    rx
}

fn frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    serde_json::from_str(&rx.try_recv().expect("expected a push frame")).unwrap()
}

#[tokio::test]
async fn comment_event_notifies_blog_owner() {
    let fabric = fabric().await;
    let mut rx = connect(&fabric, "tok-u2").await;

    let envelope = EventEnvelope::new(event_type::COMMENT_ADDED)
        .field("commentId", "c1")
        .field("blogId", "b1")
        .field("userId", "u1")
        .field("creatorId", "u2")
        .field("comment", "nice post");
    let result = fabric.bus.deliver_envelope(&envelope).await.unwrap();
    assert!(result.should_ack());

    let page = fabric.service.list("u2", 1, 10).await.unwrap();
    assert_eq!(page.total, 1);
    let created = &page.notifications[0];
    assert_eq!(created.recipient, "u2");
    assert_eq!(created.sender.as_deref(), Some("u1"));
    assert_eq!(created.notification_type, NotificationType::Comment);
    assert_eq!(created.metadata["comment"], "nice post");

    // NEW_NOTIFICATION first, then the updated counter
    let first = frame(&mut rx);
    assert_eq!(first["type"], "NEW_NOTIFICATION");
    assert_eq!(first["notification"]["type"], "comment");

    let second = frame(&mut rx);
    assert_eq!(second["type"], "UNREAD_COUNT_UPDATE");
    assert_eq!(second["count"], 1);
}

#[tokio::test]
async fn own_actions_never_notify() {
    let fabric = fabric().await;
    let mut rx = connect(&fabric, "tok-u2").await;

    let events = [
        EventEnvelope::new(event_type::BLOG_LIKED)
            .field("blogId", "b1")
            .field("likerId", "u2")
            .field("creatorId", "u2"),
        EventEnvelope::new(event_type::COMMENT_ADDED)
            .field("commentId", "c1")
            .field("userId", "u2")
            .field("creatorId", "u2"),
        EventEnvelope::new(event_type::REPLY_ADDED)
            .field("commentId", "c2")
            .field("userId", "u2")
            .field("parentOwnerId", "u2"),
        EventEnvelope::new(event_type::COMMENT_LIKED)
            .field("commentId", "c1")
            .field("likerId", "u2")
            .field("commentOwnerId", "u2"),
        EventEnvelope::new(event_type::USER_FOLLOWED)
            .field("followerId", "u2")
            .field("followedId", "u2"),
    ];

    for envelope in &events {
        let result = fabric.bus.deliver_envelope(envelope).await.unwrap();
        assert!(result.should_ack());
    }

    assert!(fabric.store.is_empty().await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn publish_never_blocks_and_never_replays() {
    let fabric = fabric().await;
    let publisher = EventPublisher::new(Arc::clone(&fabric.bus) as Arc<dyn EventBus>);

    fabric.bus.set_broker_down(true).await;
    for i in 0..3 {
        let outcome = publisher
            .emit(
                exchange::NOTIFICATION_EVENTS,
                event_type::BLOG_LIKED,
                [("blogId".to_string(), Value::from(format!("b{i}")))]
                    .into_iter()
                    .collect(),
            )
            .await;
        assert_eq!(outcome, PublishOutcome::Dropped);
    }
    assert_eq!(fabric.bus.dropped_count().await, 3);

    // Broker comes back: the dropped messages stay gone
    fabric.bus.set_broker_down(false).await;
    assert_eq!(fabric.bus.published_count().await, 0);
}

#[tokio::test]
async fn mark_all_read_drives_counter_to_zero() {
    let fabric = fabric().await;

    for i in 0..5 {
        fabric
            .bus
            .deliver_envelope(
                &EventEnvelope::new(event_type::BLOG_LIKED)
                    .field("blogId", format!("b{i}"))
                    .field("likerId", "u1")
                    .field("creatorId", "u2"),
            )
            .await
            .unwrap();
    }
    assert_eq!(fabric.service.unread_count("u2").await.unwrap(), 5);

    let mut rx = connect(&fabric, "tok-u2").await;
    assert_eq!(fabric.service.mark_all_read("u2").await.unwrap(), 5);

    assert_eq!(fabric.service.unread_count("u2").await.unwrap(), 0);
    let update = frame(&mut rx);
    assert_eq!(update["type"], "UNREAD_COUNT_UPDATE");
    assert_eq!(update["count"], 0);

    let page = fabric.service.list("u2", 1, 10).await.unwrap();
    assert!(page.notifications.iter().all(|n| n.is_read));
}

#[tokio::test]
async fn redelivered_cleanup_event_is_idempotent() {
    let fabric = fabric().await;

    fabric
        .bus
        .deliver_envelope(
            &EventEnvelope::new(event_type::COMMENT_ADDED)
                .field("commentId", "c1")
                .field("blogId", "b1")
                .field("userId", "u1")
                .field("creatorId", "u2"),
        )
        .await
        .unwrap();
    fabric
        .bus
        .deliver_envelope(
            &EventEnvelope::new(event_type::REPLY_ADDED)
                .field("commentId", "c2")
                .field("parentCommentId", "c1")
                .field("userId", "u2")
                .field("parentOwnerId", "u1"),
        )
        .await
        .unwrap();
    assert_eq!(fabric.store.len().await, 2);

    let deletion = EventEnvelope::new(event_type::COMMENT_DELETED_FROM_BLOG)
        .field("commentId", "c1");

    // Delivered once, then redelivered after a simulated consumer crash:
    // the final state is identical
    fabric.bus.deliver_envelope(&deletion).await.unwrap();
    assert!(fabric.store.is_empty().await);
    let result = fabric.bus.deliver_envelope(&deletion).await.unwrap();
    assert!(result.should_ack());
    assert!(fabric.store.is_empty().await);
}

#[tokio::test]
async fn unread_count_is_always_derived() {
    let fabric = fabric().await;

    let check = |expected: u64| {
        let service = Arc::clone(&fabric.service);
        async move {
            assert_eq!(service.unread_count("u2").await.unwrap(), expected);
        }
    };

    let first = fabric
        .service
        .create(NewNotification::new("u2", NotificationType::Like).sender("u1"))
        .await
        .unwrap()
        .unwrap();
    check(1).await;

    fabric
        .service
        .create(NewNotification::new("u2", NotificationType::Follow).sender("u1"))
        .await
        .unwrap();
    check(2).await;

    fabric.service.mark_read("u2", first.id).await.unwrap();
    check(1).await;

    fabric.service.delete("u2", first.id).await.unwrap();
    check(1).await;

    fabric.service.delete_all("u2").await.unwrap();
    check(0).await;
}

#[tokio::test]
async fn replacement_connection_receives_subsequent_pushes() {
    let fabric = fabric().await;

    let mut old_rx = connect(&fabric, "tok-u2").await;
    let mut new_rx = connect(&fabric, "tok-u2").await;

    fabric
        .bus
        .deliver_envelope(
            &EventEnvelope::new(event_type::USER_FOLLOWED)
                .field("followerId", "u1")
                .field("followedId", "u2"),
        )
        .await
        .unwrap();

    assert!(old_rx.try_recv().is_err());
    assert_eq!(frame(&mut new_rx)["type"], "NEW_NOTIFICATION");
    assert_eq!(frame(&mut new_rx)["type"], "UNREAD_COUNT_UPDATE");
}

#[tokio::test]
async fn blog_update_fans_out_per_follower_envelope() {
    let fabric = fabric().await;

    // The producer emits one envelope per follower
    for follower in ["u1", "u2"] {
        fabric
            .bus
            .deliver_envelope(
                &EventEnvelope::new(event_type::BLOG_CREATED)
                    .field("blogId", "b9")
                    .field("authorId", "author")
                    .field("followerId", follower),
            )
            .await
            .unwrap();
    }

    for follower in ["u1", "u2"] {
        let page = fabric.service.list(follower, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(
            page.notifications[0].notification_type,
            NotificationType::BlogUpdate
        );
    }
}

#[tokio::test]
async fn failing_store_leaves_message_unacked() {
    // A store that always fails drives the dispatch result that the bus
    // turns into a requeue/dead-letter decision.
    struct FailingStore;

    #[async_trait::async_trait]
    impl NotificationStore for FailingStore {
        async fn insert(
            &self,
            _: herald::notify::Notification,
        ) -> Result<herald::notify::Notification, herald::notify::StoreError> {
            Err(herald::notify::StoreError::Database(
                "disk full".to_string(),
            ))
        }
        async fn list(
            &self,
            _: &str,
            _: u32,
            _: u32,
        ) -> Result<herald::notify::NotificationPage, herald::notify::StoreError> {
            unimplemented!()
        }
        async fn unread_count(&self, _: &str) -> Result<u64, herald::notify::StoreError> {
            Ok(0)
        }
        async fn mark_read(
            &self,
            _: &str,
            _: uuid::Uuid,
        ) -> Result<bool, herald::notify::StoreError> {
            unimplemented!()
        }
        async fn mark_all_read(&self, _: &str) -> Result<u64, herald::notify::StoreError> {
            unimplemented!()
        }
        async fn delete(
            &self,
            _: &str,
            _: uuid::Uuid,
        ) -> Result<Option<herald::notify::Notification>, herald::notify::StoreError> {
            unimplemented!()
        }
        async fn delete_all(&self, _: &str) -> Result<u64, herald::notify::StoreError> {
            unimplemented!()
        }
        async fn delete_for_blog(&self, _: &str) -> Result<Vec<String>, herald::notify::StoreError> {
            unimplemented!()
        }
        async fn delete_comment_thread(
            &self,
            _: &str,
        ) -> Result<Vec<String>, herald::notify::StoreError> {
            unimplemented!()
        }
    }

    let verifier = StaticTokenVerifier::new();
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(verifier)));
    let service = Arc::new(NotificationService::new(
        Arc::new(FailingStore),
        registry,
    ));

    let mut dispatcher = Dispatcher::new();
    service.register_handlers(&mut dispatcher);

    let bus = MockEventBus::new();
    bus.subscribe(Arc::new(dispatcher)).await.unwrap();

    let result = bus
        .deliver_envelope(
            &EventEnvelope::new(event_type::USER_FOLLOWED)
                .field("followerId", "u1")
                .field("followedId", "u2"),
        )
        .await
        .unwrap();

    assert!(!result.should_ack());
}
