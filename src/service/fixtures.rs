//! Shared builders for service tests.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::tests::valid_config;
use crate::data::{Account, Database, EntityId, Owner, TokenKind, TokenValidationCache};
use crate::instagram::client::test_support::{RecordingSleeper, ScriptedTransport};
use crate::instagram::{GraphApi, RetryPolicy, RetryingClient, TokenLifecycleManager};

pub const IG_USER_ID: &str = "17841400000000001";

pub struct Fixture {
    pub _dir: TempDir,
    pub db: Arc<Database>,
    pub transport: Arc<ScriptedTransport>,
    pub sleeper: Arc<RecordingSleeper>,
    pub graph: Arc<GraphApi>,
    pub tokens: Arc<TokenLifecycleManager>,
}

pub async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::connect(&dir.path().join("test.db")).await.unwrap());
    let config = valid_config();

    let transport = Arc::new(ScriptedTransport::new());
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = RetryingClient::new(
        transport.clone(),
        sleeper.clone(),
        RetryPolicy::from_config(&config.retry),
    );
    let graph = Arc::new(GraphApi::new(client, config.instagram.clone()));
    let cache = Arc::new(TokenValidationCache::new(
        std::time::Duration::from_secs(300),
        std::time::Duration::from_secs(30),
        100,
    ));
    let tokens = Arc::new(TokenLifecycleManager::new(
        db.clone(),
        graph.clone(),
        cache,
        false,
        7,
        30,
    ));

    Fixture {
        _dir: dir,
        db,
        transport,
        sleeper,
        graph,
        tokens,
    }
}

pub fn sample_account(owner: Owner, ig_user_id: &str) -> Account {
    let now = Utc::now();
    Account {
        id: EntityId::new().0,
        owner,
        ig_user_id: ig_user_id.to_string(),
        username: "creator".to_string(),
        account_type: Some("BUSINESS".to_string()),
        access_token: Some(format!("token-{}", ig_user_id)),
        token_kind: TokenKind::LongLived,
        token_expires_at: Some(now + Duration::days(50)),
        scopes: vec!["instagram_business_basic".to_string()],
        profile_picture_url: None,
        followers_count: 0,
        follows_count: 0,
        media_count: 0,
        last_synced_at: None,
        is_active: true,
        needs_reconnect: false,
        created_at: now,
        updated_at: now,
    }
}

pub async fn stored_account(db: &Database) -> Account {
    let account = sample_account(Owner::User("u1".to_string()), IG_USER_ID);
    db.insert_account(&account).await.unwrap();
    account
}
