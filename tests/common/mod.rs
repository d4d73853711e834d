//! Common test utilities for E2E tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use creatorsync::auth::{Session, create_session_token};
use creatorsync::data::{Account, EntityId, Owner, TokenKind};
use creatorsync::instagram::{GraphRequest, GraphResponse, GraphTransport, Sleeper, TransportError};
use creatorsync::{AppState, config};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const IG_USER_ID: &str = "17841400000000001";
pub const WEBHOOK_SECRET: &str = "webhook-secret";
pub const VERIFY_TOKEN: &str = "verify-me";

// =============================================================================
// Graph API double
// =============================================================================

/// Graph transport answering from a queue first, then by URL suffix.
#[derive(Default)]
pub struct ScriptedGraph {
    queue: Mutex<VecDeque<(u16, String)>>,
    routes: Mutex<Vec<(String, u16, String)>>,
    requests: Mutex<Vec<GraphRequest>>,
}

impl ScriptedGraph {
    pub fn push(&self, status: u16, body: serde_json::Value) {
        self.queue
            .lock()
            .unwrap()
            .push_back((status, body.to_string()));
    }

    /// Answer every request whose URL ends with `suffix`.
    pub fn route(&self, suffix: &str, status: u16, body: serde_json::Value) {
        self.routes
            .lock()
            .unwrap()
            .push((suffix.to_string(), status, body.to_string()));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }
}

#[async_trait]
impl GraphTransport for ScriptedGraph {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((status, body)) = self.queue.lock().unwrap().pop_front() {
            return Ok(GraphResponse::new(status, body));
        }
        let routes = self.routes.lock().unwrap();
        let matched = routes
            .iter()
            .find(|(suffix, _, _)| request.url.ends_with(suffix.as_str()));
        Ok(match matched {
            Some((_, status, body)) => GraphResponse::new(*status, body.clone()),
            None => GraphResponse::new(
                404,
                r#"{"error":{"message":"no scripted response","code":100}}"#,
            ),
        })
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<std::time::Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<std::time::Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: std::time::Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

// =============================================================================
// Server
// =============================================================================

pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            public_url: "http://localhost".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        auth: config::AuthConfig {
            session_secret: "test-secret-key-32-bytes-long!!!".to_string(),
            session_max_age: 604800,
        },
        instagram: config::InstagramConfig {
            app_id: "test-app".to_string(),
            app_secret: "test-app-secret".to_string(),
            redirect_uri: "http://localhost/auth/instagram/callback".to_string(),
            scopes: vec![
                "instagram_business_basic".to_string(),
                "instagram_business_manage_messages".to_string(),
            ],
            authorize_url: "https://www.instagram.com/oauth/authorize".to_string(),
            oauth_base_url: "https://api.instagram.com".to_string(),
            graph_base_url: "https://graph.instagram.com".to_string(),
            api_version: "v21.0".to_string(),
            webhook_verify_tokens: vec![VERIFY_TOKEN.to_string()],
            webhook_secrets: vec![WEBHOOK_SECRET.to_string()],
            require_long_lived_token: false,
        },
        retry: config::RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            rate_limit_delay_ms: 60_000,
        },
        sync: config::SyncConfig {
            page_size: 50,
            max_pages: 10,
            history_cutoff_days: 365,
            throttle_after_pages: 5,
            page_delay_ms: 500,
            progress_every: 25,
            refresh_lookahead_days: 7,
        },
        cache: config::CacheConfig {
            token_valid_ttl: 300,
            token_invalid_ttl: 30,
            max_entries: 1000,
            profile_picture_ttl: 86400,
        },
        profile_pictures: config::ProfilePictureConfig {
            batch_cap: 100,
            concurrency: 5,
            batch_delay_ms: 1000,
        },
        quota: config::QuotaConfig {
            search_limit: 2,
            window_days: 7,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub graph: Arc<ScriptedGraph>,
    pub sleeper: Arc<RecordingSleeper>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        let graph = Arc::new(ScriptedGraph::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let state = AppState::with_graph_transport(config, graph.clone(), sleeper.clone())
            .await
            .unwrap();

        // Redirects are asserted on, not followed
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = creatorsync::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            graph,
            sleeper,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Signed session token for a user, optionally acting for a company
    pub fn session_token(&self, user_id: &str, company_id: Option<&str>) -> String {
        let session = Session::new(
            user_id,
            company_id.map(str::to_string),
            self.state.config.auth.session_max_age,
        );
        create_session_token(&session, &self.state.config.auth.session_secret)
            .expect("Failed to create test token")
    }

    /// Store a connected account with a healthy long-lived token
    pub async fn create_account(&self, owner: Owner, ig_user_id: &str) -> Account {
        let now = Utc::now();
        let account = Account {
            id: EntityId::new().0,
            owner,
            ig_user_id: ig_user_id.to_string(),
            username: "creator".to_string(),
            account_type: Some("MEDIA_CREATOR".to_string()),
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
        };
        self.state.db.insert_account(&account).await.unwrap();
        account
    }

    /// Script a token check that upstream accepts
    pub fn accept_tokens(&self) {
        self.graph.route(
            "/v21.0/me",
            200,
            serde_json::json!({"user_id": IG_USER_ID, "username": "creator"}),
        );
    }

    /// Wait until no sync is running for the account
    pub async fn wait_for_sync(&self, account_id: &str) {
        for _ in 0..200 {
            if !self.state.active_syncs.is_active(account_id) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("sync for {} did not finish", account_id);
    }
}

/// Header value for a webhook body signed with `WEBHOOK_SECRET`
pub fn sign(body: &[u8]) -> String {
    creatorsync::instagram::signature::sign(WEBHOOK_SECRET, body)
}
