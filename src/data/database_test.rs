//! Database tests

use super::*;
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn account(owner: Owner, ig_user_id: &str) -> Account {
    let now = Utc::now();
    Account {
        id: EntityId::new().0,
        owner,
        ig_user_id: ig_user_id.to_string(),
        username: "creator".to_string(),
        account_type: Some("BUSINESS".to_string()),
        access_token: Some("token".to_string()),
        token_kind: TokenKind::LongLived,
        token_expires_at: Some(now + Duration::days(60)),
        scopes: vec!["instagram_business_basic".to_string()],
        profile_picture_url: Some("https://cdn.example/creator.jpg".to_string()),
        followers_count: 10,
        follows_count: 5,
        media_count: 2,
        last_synced_at: None,
        is_active: true,
        needs_reconnect: false,
        created_at: now,
        updated_at: now,
    }
}

fn at(minutes: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn incoming(account_id: &str, ig_message_id: &str, conversation: &str, minutes: i64) -> Message {
    Message {
        id: EntityId::new().0,
        account_id: account_id.to_string(),
        conversation_id: conversation.to_string(),
        ig_message_id: ig_message_id.to_string(),
        sender_id: "fan".to_string(),
        sender_username: Some("fan_name".to_string()),
        recipient_id: "me".to_string(),
        recipient_username: None,
        body: Some("hello".to_string()),
        message_type: MessageType::Image,
        attachments: vec![Attachment {
            kind: "image".to_string(),
            url: Some("https://cdn.example/a.jpg".to_string()),
        }],
        is_incoming: true,
        is_read: false,
        sent_at: Some(at(minutes)),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_account_insert_and_lookups() {
    let (db, _temp_dir) = create_test_db().await;
    let owner = Owner::Company("c1".to_string());
    let stored = account(owner.clone(), "1784");
    db.insert_account(&stored).await.unwrap();

    let by_id = db.get_account(&stored.id).await.unwrap().unwrap();
    assert_eq!(by_id.owner, owner);
    assert_eq!(by_id.token_kind, TokenKind::LongLived);
    assert_eq!(by_id.scopes, stored.scopes);
    assert_eq!(
        by_id.token_expires_at.map(|t| t.timestamp()),
        stored.token_expires_at.map(|t| t.timestamp())
    );

    assert!(db.get_account_by_owner(&owner).await.unwrap().is_some());
    assert!(db.get_account_by_ig_user_id("1784").await.unwrap().is_some());
    assert!(
        db.get_account_by_owner(&Owner::User("c1".to_string()))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        db.find_profile_picture_by_username("CREATOR").await.unwrap(),
        stored.profile_picture_url
    );
}

#[tokio::test]
async fn test_instagram_identity_is_unique() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_account(&account(Owner::User("u1".to_string()), "1784"))
        .await
        .unwrap();

    let duplicate = db
        .insert_account(&account(Owner::User("u2".to_string()), "1784"))
        .await;
    assert!(duplicate.is_err());
}

#[tokio::test]
async fn test_disconnect_and_reconnect_flags() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    db.insert_account(&stored).await.unwrap();

    db.mark_account_needs_reconnect(&stored.id).await.unwrap();
    assert!(db.get_account(&stored.id).await.unwrap().unwrap().needs_reconnect);

    db.update_account_token(&stored.id, "fresh", TokenKind::LongLived, Some(Utc::now()))
        .await
        .unwrap();
    let refreshed = db.get_account(&stored.id).await.unwrap().unwrap();
    assert!(!refreshed.needs_reconnect);
    assert_eq!(refreshed.access_token.as_deref(), Some("fresh"));

    assert!(db.disconnect_account(&stored.id).await.unwrap());
    let disconnected = db.get_account(&stored.id).await.unwrap().unwrap();
    assert!(!disconnected.is_active);
    assert!(disconnected.access_token.is_none());
}

#[tokio::test]
async fn test_message_insert_is_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    db.insert_account(&stored).await.unwrap();

    let message = incoming(&stored.id, "m1", "c1", 0);
    assert!(db.insert_message(&message).await.unwrap());

    let mut redelivered = incoming(&stored.id, "m1", "c1", 0);
    redelivered.body = Some("changed".to_string());
    assert!(!db.insert_message(&redelivered).await.unwrap());

    let messages = db.get_messages_for_account(&stored.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body.as_deref(), Some("hello"));
    assert_eq!(messages[0].message_type, MessageType::Image);
    assert_eq!(messages[0].attachments.len(), 1);
    assert_eq!(messages[0].sent_at, Some(at(0)));
}

#[tokio::test]
async fn test_existing_message_ids() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    db.insert_account(&stored).await.unwrap();
    for id in ["a", "b"] {
        db.insert_message(&incoming(&stored.id, id, "c1", 0)).await.unwrap();
    }

    let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let existing = db
        .get_existing_message_ids(&stored.id, &candidates)
        .await
        .unwrap();

    assert_eq!(existing.len(), 2);
    assert!(!existing.contains("c"));
    assert!(
        db.get_existing_message_ids(&stored.id, &[])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_mark_read_leaves_later_messages_unread() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    db.insert_account(&stored).await.unwrap();
    db.insert_message(&incoming(&stored.id, "m1", "c1", 0)).await.unwrap();
    db.insert_message(&incoming(&stored.id, "m2", "c1", 5)).await.unwrap();
    db.insert_message(&incoming(&stored.id, "other", "c2", 0)).await.unwrap();

    let updated = db
        .mark_conversation_read(&stored.id, "c1", at(5))
        .await
        .unwrap();
    assert_eq!(updated, 2);

    db.insert_message(&incoming(&stored.id, "m3", "c1", 6)).await.unwrap();
    let unread: Vec<_> = db
        .get_messages_for_account(&stored.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.is_incoming && !m.is_read)
        .map(|m| m.ig_message_id)
        .collect();
    assert_eq!(unread, vec!["other".to_string(), "m3".to_string()]);
}

#[tokio::test]
async fn test_conversation_lookup_prefers_latest_message() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    db.insert_account(&stored).await.unwrap();
    db.insert_message(&incoming(&stored.id, "m1", "old-thread", 0)).await.unwrap();
    db.insert_message(&incoming(&stored.id, "m2", "new-thread", 10)).await.unwrap();

    assert_eq!(
        db.find_conversation_id_for_counterparty(&stored.id, "fan")
            .await
            .unwrap()
            .as_deref(),
        Some("new-thread")
    );
    assert!(
        db.find_conversation_id_for_counterparty(&stored.id, "stranger")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_synthetic_conversation_is_adopted() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    let other = account(Owner::User("u2".to_string()), "1785");
    db.insert_account(&stored).await.unwrap();
    db.insert_account(&other).await.unwrap();
    db.insert_message(&incoming(&stored.id, "m1", "ig:fan", 0)).await.unwrap();
    db.insert_message(&incoming(&stored.id, "m2", "ig:someone", 1)).await.unwrap();
    db.insert_message(&incoming(&other.id, "m3", "ig:fan", 2)).await.unwrap();

    let moved = db
        .adopt_synthetic_conversation(&stored.id, "fan", "conv-real")
        .await
        .unwrap();
    assert_eq!(moved, 1);

    let threads: Vec<(String, String)> = db
        .get_messages_for_account(&stored.id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| (m.ig_message_id, m.conversation_id))
        .collect();
    assert!(threads.contains(&("m1".to_string(), "conv-real".to_string())));
    assert!(threads.contains(&("m2".to_string(), "ig:someone".to_string())));

    let untouched = db.get_messages_for_account(&other.id).await.unwrap();
    assert_eq!(untouched[0].conversation_id, "ig:fan");
}

#[tokio::test]
async fn test_post_upsert_refreshes_counters() {
    let (db, _temp_dir) = create_test_db().await;
    let stored = account(Owner::User("u1".to_string()), "1784");
    db.insert_account(&stored).await.unwrap();

    let mut post = Post {
        id: EntityId::new().0,
        account_id: stored.id.clone(),
        ig_media_id: "media-1".to_string(),
        media_type: "IMAGE".to_string(),
        media_url: None,
        thumbnail_url: None,
        permalink: None,
        caption: Some("#launch with @brand".to_string()),
        like_count: 1,
        comments_count: 0,
        hashtags: vec!["launch".to_string()],
        mentions: vec!["brand".to_string()],
        impressions: Some(100),
        reach: Some(80),
        saved: None,
        posted_at: Some(at(0)),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    db.upsert_post(&post).await.unwrap();

    post.id = EntityId::new().0;
    post.like_count = 42;
    post.impressions = None;
    db.upsert_post(&post).await.unwrap();

    let posts = db.get_posts(&stored.id).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].like_count, 42);
    // Missing insights keep the previous values.
    assert_eq!(posts[0].impressions, Some(100));
    assert_eq!(posts[0].hashtags, vec!["launch".to_string()]);
}

#[tokio::test]
async fn test_search_events_window() {
    let (db, _temp_dir) = create_test_db().await;
    db.record_search_event("user:u1", "a", at(0)).await.unwrap();
    db.record_search_event("user:u1", "b", at(10)).await.unwrap();
    db.record_search_event("user:u2", "c", at(10)).await.unwrap();

    let (used, oldest) = db.search_events_since("user:u1", at(5)).await.unwrap();
    assert_eq!(used, 1);
    assert_eq!(oldest, Some(at(10)));

    let (none, oldest) = db.search_events_since("user:u3", at(0)).await.unwrap();
    assert_eq!(none, 0);
    assert_eq!(oldest, None);
}

#[tokio::test]
async fn test_search_reservation_respects_limit() {
    let (db, _temp_dir) = create_test_db().await;
    db.record_search_event("user:u1", "old", at(0)).await.unwrap();

    let first = db
        .reserve_search_event("user:u1", "a", at(10), at(5), 1)
        .await
        .unwrap();
    assert!(first.is_some());
    let refused = db
        .reserve_search_event("user:u1", "b", at(11), at(5), 1)
        .await
        .unwrap();
    assert!(refused.is_none());

    db.release_search_event(&first.unwrap()).await.unwrap();
    let (used, _) = db.search_events_since("user:u1", at(5)).await.unwrap();
    assert_eq!(used, 0);
    assert!(
        db.reserve_search_event("user:u1", "b", at(11), at(5), 1)
            .await
            .unwrap()
            .is_some()
    );
}
