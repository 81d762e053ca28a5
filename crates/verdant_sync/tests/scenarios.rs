//! End-to-end behaviour of a signed-in client against the fake backend.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use verdant_protocol::{MutationStatus, PostId, PushEvent, Timestamp, UserId};
use verdant_sync::{ConnectionState, StaticCredential, SyncClient, SyncError, SyncEvent, SyncPorts};
use verdant_testkit::prelude::*;

async fn next_event<F>(events: &mut broadcast::Receiver<SyncEvent>, matches: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    within(async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
}

fn p(id: &str) -> PostId {
    PostId::new(id)
}

#[tokio::test]
async fn offline_like_then_confirm() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    session.client.like(&p("p1")).unwrap();
    let shown = session.shown("p1");
    assert_eq!(shown.like_count, 11);
    assert!(shown.liked_by_me);

    session.backend.resume_writes();
    session.settle().await;
    assert_eq!(session.shown("p1").like_count, 11);
    assert_eq!(session.backend.post(&p("p1")).unwrap().like_count, 11);

    // The server echoed our like on the push channel. A later event on the
    // same channel proves the echo was handled without counting it.
    session.backend.add_remote_like(&p("p1"), "bob");
    assert!(eventually(|| session.shown("p1").like_count == 12).await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(session.shown("p1").like_count, 12);
}

#[tokio::test]
async fn duplicate_like_rejected() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    let first = session.client.like(&p("p1")).unwrap();
    let err = session.client.like(&p("p1")).unwrap_err();
    assert!(matches!(err, SyncError::DuplicateInFlight { existing, .. } if existing == first));
    assert_eq!(session.shown("p1").like_count, 11);

    session.backend.resume_writes();
    session.settle().await;
    assert_eq!(session.backend.applied_writes(), 1);
    assert_eq!(session.backend.post(&p("p1")).unwrap().like_count, 11);
}

#[tokio::test]
async fn comment_event_deferred_behind_pending_comment() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    let (_, placeholder) = session.client.comment(&p("p1"), "try neem oil").unwrap();
    session.backend.add_remote_comment(&p("p1"), "bob", "looks like blight");

    assert!(eventually(|| session.client.reconciler().deferred_len() == 1).await);
    let shown = session.shown("p1");
    assert_eq!(shown.comments.len(), 1);
    assert_eq!(shown.comments[0].id, placeholder);

    session.backend.resume_writes();
    session.settle().await;
    assert!(eventually(|| session.shown("p1").comments.len() == 2).await);

    let shown = session.shown("p1");
    let mine = shown
        .comments
        .iter()
        .find(|c| c.author_id.as_str() == LOCAL_USER)
        .unwrap();
    assert!(!mine.id.is_local());
    assert_eq!(mine.client_ref.as_ref(), Some(&placeholder));
    assert!(shown.comments.iter().any(|c| c.content == "looks like blight"));
    assert_eq!(session.client.reconciler().deferred_len(), 0);
}

#[tokio::test]
async fn like_events_deferred_behind_pending_like_are_not_double_counted() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    session.client.like(&p("p1")).unwrap();
    // Counted by the server before our write is applied.
    session.backend.add_remote_like(&p("p1"), "bob");
    assert!(eventually(|| session.client.reconciler().deferred_len() == 1).await);
    assert_eq!(session.shown("p1").like_count, 11);

    session.backend.resume_writes();
    session.settle().await;
    assert_eq!(session.shown("p1").like_count, 12);

    // Counted after it.
    session.backend.add_remote_like(&p("p1"), "eve");
    assert!(eventually(|| session.shown("p1").like_count == 13).await);
    assert_eq!(session.backend.post(&p("p1")).unwrap().like_count, 13);
}

#[tokio::test]
async fn permanent_rejection_rolls_back_once() {
    let session = TestSession::start(sample_posts()).await;
    let mut events = session.client.subscribe();
    session.backend.reject_next_write("post is locked");

    let id = session.client.like(&p("p2")).unwrap();
    let event = next_event(&mut events, |e| matches!(e, SyncEvent::MutationRejected { .. })).await;
    match event {
        SyncEvent::MutationRejected { id: rejected, reason, .. } => {
            assert_eq!(rejected, id);
            assert!(reason.contains("post is locked"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.settle().await;
    let shown = session.shown("p2");
    assert_eq!(shown.like_count, 0);
    assert!(!shown.liked_by_me);
    assert_eq!(session.backend.sends(), 1);
}

#[tokio::test]
async fn bounded_retry_then_park_and_user_retry() {
    let session = TestSession::start(sample_posts()).await;
    let mut events = session.client.subscribe();
    session.backend.fail_next_writes(100);

    let id = session.client.like(&p("p1")).unwrap();
    let event = next_event(&mut events, |e| matches!(e, SyncEvent::MutationFailed { .. })).await;
    assert!(matches!(event, SyncEvent::MutationFailed { attempts: 6, .. }));

    // One attempt plus five retries, then the like visibly reverts.
    assert_eq!(session.backend.sends(), 6);
    let record = session.client.mutation(id).unwrap();
    assert!(record.parked);
    assert_eq!(record.status, MutationStatus::Failed);
    let shown = session.shown("p1");
    assert_eq!(shown.like_count, 10);
    assert!(!shown.liked_by_me);
    assert_eq!(session.client.stats().parked, 1);

    session.backend.fail_next_writes(0);
    session.client.retry(id).unwrap();
    assert!(session.shown("p1").liked_by_me);
    session.settle().await;
    assert_eq!(session.shown("p1").like_count, 11);
    assert_eq!(session.backend.applied_writes(), 1);
}

#[tokio::test]
async fn transient_failures_then_success_confirm_once() {
    let session = TestSession::start(sample_posts()).await;
    let mut events = session.client.subscribe();
    session.backend.fail_next_writes(3);

    let id = session.client.like(&p("p1")).unwrap();
    let event = next_event(&mut events, |e| matches!(e, SyncEvent::MutationConfirmed { .. })).await;
    assert!(matches!(event, SyncEvent::MutationConfirmed { id: confirmed, .. } if confirmed == id));
    session.settle().await;

    assert_eq!(session.backend.sends(), 4);
    assert_eq!(session.backend.applied_writes(), 1);
    assert!(session.client.mutation(id).is_none());
    assert_eq!(session.shown("p1").like_count, 11);
    assert_eq!(session.backend.post(&p("p1")).unwrap().like_count, 11);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(
            event,
            SyncEvent::MutationConfirmed { .. } | SyncEvent::MutationFailed { .. }
        ));
    }
}

#[tokio::test]
async fn discarding_parked_write_keeps_it_reverted() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.fail_next_writes(100);

    let id = session.client.comment(&p("p3"), "copper spray").unwrap().0;
    assert!(eventually(|| session.client.stats().parked == 1).await);
    assert!(session.shown("p3").comments.is_empty());

    session.client.discard(id).unwrap();
    assert!(session.client.queue().is_empty());
    assert!(session.shown("p3").comments.is_empty());
}

#[tokio::test]
async fn writes_to_one_post_reach_server_in_order() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    session.client.comment(&p("p2"), "first").unwrap();
    session.client.delete_post(&p("p2")).unwrap();
    assert!(session.client.post(&p("p2")).is_none());
    assert!(eventually(|| session.client.stats().processing == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    // The delete waits behind the comment.
    assert_eq!(session.client.stats().processing, 1);
    assert_eq!(session.client.stats().pending, 1);

    session.backend.resume_writes();
    session.settle().await;
    assert!(session.backend.post(&p("p2")).is_none());
    assert!(session.client.post(&p("p2")).is_none());
    assert_eq!(session.backend.applied_writes(), 2);
}

#[tokio::test]
async fn created_post_moves_to_server_id_with_followers() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    let (_, local_id) = session.client.create_post("powdery mildew?", None).unwrap();
    assert!(local_id.is_local());
    session.client.comment(&local_id, "looks like it").unwrap();
    session.client.like(&local_id).unwrap();
    assert_eq!(session.client.feed()[0].id, local_id);

    session.backend.resume_writes();
    session.settle().await;

    let feed = session.client.feed();
    assert!(feed.iter().all(|post| !post.id.is_local()));
    let created = &feed[0];
    assert_eq!(created.content, "powdery mildew?");
    assert_eq!(created.like_count, 1);
    assert!(created.liked_by_me);
    assert_eq!(created.comments.len(), 1);

    let server = session.backend.post(&created.id).unwrap();
    assert_eq!(server.like_count, 1);
    assert_eq!(server.comments.len(), 1);
}

#[tokio::test]
async fn repeated_push_deliveries_apply_once() {
    let session = TestSession::start(sample_posts()).await;

    let event = session.backend.add_remote_like(&p("p3"), "bob");
    session.backend.push_event(&event);
    session.backend.push_event(&event);
    // A fresh event behind the duplicates on the same channel.
    session.backend.add_remote_like(&p("p3"), "eve");

    assert!(eventually(|| session.shown("p3").like_count == 5).await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(session.shown("p3").like_count, 5);
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let session = TestSession::start(sample_posts()).await;

    session.backend.push_raw("not json");
    session.backend.push_raw(r#"{"type":"poke","data":{}}"#);
    session.backend.push_raw(r#"{"type":"like-delta","data":{"userId":"bob","postId":"p2","timestamp":5}}"#);
    session.backend.add_remote_like(&p("p2"), "bob");

    assert!(eventually(|| session.shown("p2").like_count == 1).await);
    assert_eq!(session.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn notifications_reach_subscribers() {
    let session = TestSession::start(sample_posts()).await;
    let mut events = session.client.subscribe();

    session.backend.push_event(&PushEvent::notification(
        "n1",
        UserId::new("bob"),
        Some(p("p1")),
        "bob replied to your post",
        Timestamp::from_millis(50),
    ));

    let event = next_event(&mut events, |e| matches!(e, SyncEvent::Notification { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Notification {
            from: UserId::new("bob"),
            post_id: Some(p("p1")),
            message: "bob replied to your post".into(),
        }
    );
}

#[tokio::test]
async fn reconnect_gap_fills_missed_events() {
    let session = TestSession::start(sample_posts()).await;
    let mut events = session.client.subscribe();

    session.backend.fail_connects(u32::MAX);
    session.backend.drop_connections();
    assert!(eventually(|| session.client.connection_state() == ConnectionState::Reconnecting).await);

    // Missed while disconnected.
    session.backend.add_remote_like(&p("p1"), "bob");
    session.backend.add_remote_comment(&p("p3"), "eve", "same here");
    assert!(eventually(|| session.client.is_offline()).await);
    next_event(&mut events, |e| *e == SyncEvent::Offline(true)).await;

    session.backend.fail_connects(0);
    next_event(&mut events, |e| matches!(e, SyncEvent::GapFilled { .. })).await;
    assert!(!session.client.is_offline());
    assert_eq!(session.client.connection_state(), ConnectionState::Connected);
    assert_eq!(session.shown("p1").like_count, 11);
    assert_eq!(session.shown("p3").comments.len(), 1);
}

#[tokio::test]
async fn late_event_counted_by_gap_fill_is_not_added() {
    let session = TestSession::start(sample_posts()).await;
    let mut events = session.client.subscribe();

    session.backend.fail_connects(u32::MAX);
    session.backend.drop_connections();
    assert!(eventually(|| session.client.connection_state() == ConnectionState::Reconnecting).await);

    // Counted by the server now, delivered only after the gap fill.
    let late = session.backend.add_remote_like_held(&p("p1"), "bob");
    session.backend.fail_connects(0);
    next_event(&mut events, |e| matches!(e, SyncEvent::GapFilled { .. })).await;
    assert_eq!(session.shown("p1").like_count, 11);

    session.backend.push_event(&late);
    session.backend.add_remote_like(&p("p1"), "eve");
    assert!(eventually(|| session.shown("p1").like_count == 12).await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(session.shown("p1").like_count, 12);
}

#[tokio::test]
async fn gap_fill_keeps_unconfirmed_writes() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();
    session.client.like(&p("p3")).unwrap();
    assert_eq!(session.shown("p3").like_count, 4);

    session.backend.fail_connects(u32::MAX);
    session.backend.drop_connections();
    session.backend.add_remote_like(&p("p3"), "bob");
    assert!(eventually(|| session.client.connection_state() == ConnectionState::Reconnecting).await);

    let mut events = session.client.subscribe();
    session.backend.fail_connects(0);
    next_event(&mut events, |e| matches!(e, SyncEvent::GapFilled { .. })).await;

    // Server value 4 plus the pending like.
    let shown = session.shown("p3");
    assert_eq!(shown.like_count, 5);
    assert!(shown.liked_by_me);

    session.backend.resume_writes();
    session.settle().await;
    assert_eq!(session.shown("p3").like_count, 5);
    assert_eq!(session.backend.post(&p("p3")).unwrap().like_count, 5);
}

#[tokio::test]
async fn logout_abandons_in_flight_and_login_resumes() {
    let session = TestSession::start(sample_posts()).await;
    session.backend.pause_writes();

    let id = session.client.like(&p("p1")).unwrap();
    assert!(
        eventually(|| session.client.mutation(id).map(|r| r.status) == Some(MutationStatus::Processing))
            .await
    );

    session.client.logout().await.unwrap();
    let record = session.client.mutation(id).unwrap();
    assert_eq!(record.status, MutationStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("cancelled by logout"));
    assert_eq!(record.retry_count, 0);
    assert!(session.client.feed().is_empty());
    assert_eq!(session.client.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(session.client.like(&p("p1")), Err(SyncError::NotLoggedIn)));

    // Nothing lands in the store after logout.
    session.backend.add_remote_like(&p("p2"), "bob");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(session.client.feed().is_empty());

    session.backend.resume_writes();
    session.login().await;
    assert!(session.shown("p1").liked_by_me);
    session.settle().await;
    assert_eq!(session.shown("p1").like_count, 11);
    assert_eq!(session.backend.applied_writes(), 1);
}

#[tokio::test]
async fn journal_survives_restart() {
    let journal = TempJournal::new();
    let backend = FakeBackend::with_posts(LOCAL_USER, sample_posts());
    backend.pause_writes();

    let id = {
        let client = SyncClient::open(
            test_config(),
            SyncPorts::from_backend(Arc::clone(&backend)),
            Box::new(journal.open()),
        )
        .unwrap();
        client
            .login(Arc::new(StaticCredential::new("test-token")))
            .await
            .unwrap();
        let id = client.like(&p("p2")).unwrap();
        assert!(eventually(|| client.stats().processing == 1).await);
        client.logout().await.unwrap();
        id
    };

    backend.resume_writes();
    let client = SyncClient::open(
        test_config(),
        SyncPorts::from_backend(Arc::clone(&backend)),
        Box::new(journal.open()),
    )
    .unwrap();
    assert_eq!(client.mutation(id).unwrap().status, MutationStatus::Failed);

    client
        .login(Arc::new(StaticCredential::new("test-token")))
        .await
        .unwrap();
    assert!(client.post(&p("p2")).unwrap().liked_by_me);
    assert!(eventually(|| client.queue().is_empty()).await);
    assert_eq!(backend.post(&p("p2")).unwrap().like_count, 1);
    assert_eq!(backend.applied_writes(), 1);
    client.logout().await.unwrap();
}
