//! Typed Instagram Graph API calls
//!
//! Every call goes through [`RetryingClient`]; failures come back as
//! [`AppError`] kinds already classified for the caller.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

use super::client::{GraphRequest, GraphResponse, RetryingClient};
use crate::config::InstagramConfig;
use crate::error::AppError;

const PROFILE_FIELDS: &str =
    "user_id,username,account_type,profile_picture_url,followers_count,follows_count,media_count";
const MESSAGE_FIELDS: &str = "id,created_time,from,to,message,attachments";
const MEDIA_FIELDS: &str =
    "id,caption,media_type,media_url,thumbnail_url,permalink,timestamp,like_count,comments_count";
const INSIGHT_METRICS: &str = "impressions,reach,saved";

// =============================================================================
// Wire types
// =============================================================================

/// Accept ids sent either as JSON strings or numbers.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        String(String),
        Number(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::String(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "string_or_number")] String);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

/// Permissions arrive as a list or as a comma separated string.
fn permission_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::List(list)) => list,
        Some(Raw::Joined(joined)) => joined
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => Vec::new(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cursors {
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paging {
    pub cursors: Option<Cursors>,
    pub next: Option<String>,
}

/// One page of a cursor-paginated collection
///
/// Items are decoded one at a time; records that do not decode are counted
/// in `malformed` instead of failing the page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub paging: Option<Paging>,
    pub malformed: usize,
}

#[derive(Deserialize)]
struct RawPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    paging: Option<Paging>,
}

impl<'de, T: serde::de::DeserializeOwned> Deserialize<'de> for Page<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawPage::deserialize(deserializer)?;
        let mut data = Vec::with_capacity(raw.data.len());
        let mut malformed = 0;
        for item in raw.data {
            match serde_json::from_value::<T>(item) {
                Ok(record) => data.push(record),
                Err(error) => {
                    tracing::warn!(%error, "Skipping undecodable Graph record");
                    malformed += 1;
                }
            }
        }
        Ok(Self {
            data,
            paging: raw.paging,
            malformed,
        })
    }
}

impl<T> Page<T> {
    pub fn next_url(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|p| p.next.as_deref())
            .filter(|next| !next.is_empty())
    }
}

/// `{"data": [...]}` wrapper without paging
#[derive(Debug, Clone, Deserialize)]
pub struct DataList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for DataList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

/// Result of the authorization-code exchange
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default, deserialize_with = "permission_list")]
    pub permissions: Vec<String>,
}

/// Long-lived token from an exchange or refresh
#[derive(Debug, Clone, Deserialize)]
pub struct LongLivedToken {
    pub access_token: String,
    pub token_type: Option<String>,
    /// Seconds until expiry
    pub expires_in: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub id: Option<String>,
    pub username: String,
    pub account_type: Option<String>,
    pub profile_picture_url: Option<String>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub follows_count: i64,
    #[serde(default)]
    pub media_count: i64,
}

impl Profile {
    /// Professional account id, falling back to the app-scoped id.
    pub fn ig_user_id(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaUrl {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentRecord {
    pub image_data: Option<MediaUrl>,
    pub video_data: Option<MediaUrl>,
    pub audio_data: Option<MediaUrl>,
    pub file_url: Option<String>,
    pub share: Option<MediaUrl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub created_time: Option<String>,
    pub from: Option<Participant>,
    #[serde(default)]
    pub to: DataList<Participant>,
    pub message: Option<String>,
    #[serde(default)]
    pub attachments: DataList<AttachmentRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub updated_time: Option<String>,
    #[serde(default)]
    pub participants: DataList<Participant>,
    pub messages: Option<Page<MessageRecord>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub caption: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub permalink: Option<String>,
    pub timestamp: Option<String>,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub comments_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInsights {
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub saved: Option<i64>,
}

#[derive(Deserialize)]
struct InsightValue {
    value: Option<i64>,
}

#[derive(Deserialize)]
struct InsightMetric {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
    total_value: Option<InsightValue>,
}

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct BusinessProfile {
    pub username: String,
    pub name: Option<String>,
    pub biography: Option<String>,
    pub profile_picture_url: Option<String>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub follows_count: i64,
    #[serde(default)]
    pub media_count: i64,
}

#[derive(Deserialize)]
struct BusinessDiscoveryEnvelope {
    business_discovery: Option<BusinessProfile>,
}

/// Parse Graph timestamps (`2024-05-01T12:00:00+0000` or RFC 3339).
pub fn parse_graph_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

// =============================================================================
// API
// =============================================================================

pub struct GraphApi {
    client: RetryingClient,
    config: InstagramConfig,
    rate_limit_secs: u64,
}

impl GraphApi {
    pub fn new(client: RetryingClient, config: InstagramConfig) -> Self {
        let rate_limit_secs = client.policy().rate_limit_delay.as_secs().max(1);
        Self {
            client,
            config,
            rate_limit_secs,
        }
    }

    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    fn versioned(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.graph_base_url.trim_end_matches('/'),
            self.config.api_version,
            path.trim_start_matches('/')
        )
    }

    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, AppError> {
        self.client
            .request(request)
            .await
            .into_result(self.rate_limit_secs)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: GraphRequest,
    ) -> Result<T, AppError> {
        let target = request.log_target().to_string();
        let response = self.send(request).await?;
        response.json().map_err(|e| {
            tracing::warn!(error = %e, target_url = %target, "Unexpected Graph API response shape");
            AppError::Upstream(format!("malformed response: {}", e))
        })
    }

    /// Build the authorization dialog URL.
    pub fn authorize_url(&self, state: &str) -> Result<String, AppError> {
        let url = url::Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", self.config.app_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", &self.config.scopes.join(",")),
                ("state", state),
            ],
        )
        .map_err(|e| AppError::Config(format!("instagram.authorize_url: {}", e)))?;
        Ok(url.to_string())
    }

    /// Exchange an authorization code for a short-lived token.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AppError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum GrantShape {
            Wrapped { data: Vec<TokenGrant> },
            Flat(TokenGrant),
        }

        let url = format!(
            "{}/oauth/access_token",
            self.config.oauth_base_url.trim_end_matches('/')
        );
        let request = GraphRequest::post_form(
            url,
            vec![
                ("client_id".to_string(), self.config.app_id.clone()),
                ("client_secret".to_string(), self.config.app_secret.clone()),
                ("grant_type".to_string(), "authorization_code".to_string()),
                ("redirect_uri".to_string(), self.config.redirect_uri.clone()),
                ("code".to_string(), code.to_string()),
            ],
        );

        match self.send_json::<GrantShape>(request).await? {
            GrantShape::Flat(grant) => Ok(grant),
            GrantShape::Wrapped { data } => data
                .into_iter()
                .next()
                .ok_or_else(|| AppError::Upstream("token exchange returned no grant".to_string())),
        }
    }

    /// Exchange a short-lived token for a long-lived one.
    pub async fn exchange_long_lived(&self, short_token: &str) -> Result<LongLivedToken, AppError> {
        let url = format!(
            "{}/access_token",
            self.config.graph_base_url.trim_end_matches('/')
        );
        let request = GraphRequest::get(url)
            .query("grant_type", "ig_exchange_token")
            .query("client_secret", self.config.app_secret.clone())
            .query("access_token", short_token);
        self.send_json(request).await
    }

    /// Extend a long-lived token.
    pub async fn refresh_token(&self, token: &str) -> Result<LongLivedToken, AppError> {
        let url = format!(
            "{}/refresh_access_token",
            self.config.graph_base_url.trim_end_matches('/')
        );
        let request = GraphRequest::get(url)
            .query("grant_type", "ig_refresh_token")
            .query("access_token", token);
        self.send_json(request).await
    }

    pub async fn fetch_profile(&self, token: &str) -> Result<Profile, AppError> {
        let request = GraphRequest::get(self.versioned("me"))
            .query("fields", PROFILE_FIELDS)
            .query("access_token", token);
        self.send_json(request).await
    }

    /// `Ok(false)` only when upstream explicitly says the token is unusable.
    pub async fn validate_token(&self, token: &str) -> Result<bool, AppError> {
        let request = GraphRequest::get(self.versioned("me"))
            .query("fields", "user_id")
            .query("access_token", token);
        match self.send(request).await {
            Ok(_) => Ok(true),
            Err(AppError::ReconnectRequired) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// First page of conversations, each with its latest messages inlined.
    pub async fn conversations_page(
        &self,
        token: &str,
        page_size: u32,
    ) -> Result<Page<ConversationRecord>, AppError> {
        let request = GraphRequest::get(self.versioned("me/conversations"))
            .query("platform", "instagram")
            .query(
                "fields",
                format!("id,updated_time,participants,messages{{{}}}", MESSAGE_FIELDS),
            )
            .query("limit", page_size.to_string())
            .query("access_token", token);
        self.send_json(request).await
    }

    pub async fn media_page(&self, token: &str, page_size: u32) -> Result<Page<MediaRecord>, AppError> {
        let request = GraphRequest::get(self.versioned("me/media"))
            .query("fields", MEDIA_FIELDS)
            .query("limit", page_size.to_string())
            .query("access_token", token);
        self.send_json(request).await
    }

    /// Follow an upstream `paging.next` link verbatim.
    pub async fn next_page<T: serde::de::DeserializeOwned>(
        &self,
        next_url: &str,
    ) -> Result<Page<T>, AppError> {
        self.send_json(GraphRequest::get(next_url)).await
    }

    pub async fn media_insights(
        &self,
        token: &str,
        media_id: &str,
    ) -> Result<MediaInsights, AppError> {
        let request = GraphRequest::get(self.versioned(&format!("{}/insights", media_id)))
            .query("metric", INSIGHT_METRICS)
            .query("access_token", token);
        let metrics: DataList<InsightMetric> = self.send_json(request).await?;

        let values: HashMap<String, i64> = metrics
            .data
            .into_iter()
            .filter_map(|metric| {
                let value = metric
                    .total_value
                    .and_then(|v| v.value)
                    .or_else(|| metric.values.first().and_then(|v| v.value))?;
                Some((metric.name, value))
            })
            .collect();

        Ok(MediaInsights {
            impressions: values.get("impressions").copied(),
            reach: values.get("reach").copied(),
            saved: values.get("saved").copied(),
        })
    }

    /// Public profile of another professional account.
    pub async fn business_discovery(
        &self,
        token: &str,
        ig_user_id: &str,
        username: &str,
    ) -> Result<Option<BusinessProfile>, AppError> {
        let fields = format!(
            "business_discovery.username({}){{username,name,biography,profile_picture_url,followers_count,follows_count,media_count}}",
            username
        );
        let request = GraphRequest::get(self.versioned(ig_user_id))
            .query("fields", fields)
            .query("access_token", token);
        let envelope: BusinessDiscoveryEnvelope = self.send_json(request).await?;
        Ok(envelope.business_discovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::instagram::client::RetryPolicy;
    use crate::instagram::client::test_support::{RecordingSleeper, ScriptedTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn api(transport: Arc<ScriptedTransport>) -> GraphApi {
        let config = crate::config::tests::valid_config();
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            rate_limit_delay_ms: 60_000,
        });
        let client = RetryingClient::new(transport, Arc::new(RecordingSleeper::default()), policy);
        GraphApi::new(client, config.instagram)
    }

    #[tokio::test]
    async fn exchange_code_accepts_wrapped_and_flat_shapes() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(
            200,
            json!({"data": [{"access_token": "short", "user_id": 17841400000000001_i64, "permissions": "a,b"}]}),
        );
        transport.push_json(
            200,
            json!({"access_token": "short2", "user_id": "17841400000000002", "permissions": ["a"]}),
        );
        let api = api(transport.clone());

        let wrapped = api.exchange_code("code-1").await.unwrap();
        assert_eq!(wrapped.user_id, "17841400000000001");
        assert_eq!(wrapped.permissions, vec!["a", "b"]);

        let flat = api.exchange_code("code-2").await.unwrap();
        assert_eq!(flat.access_token, "short2");

        let first = transport.requests.lock().unwrap()[0].clone();
        let form = first.form.unwrap();
        assert!(form.contains(&("code".to_string(), "code-1".to_string())));
        assert!(form.contains(&("grant_type".to_string(), "authorization_code".to_string())));
    }

    #[tokio::test]
    async fn validate_token_distinguishes_invalid_from_unreachable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, json!({"user_id": "1"}));
        transport.push_json(400, json!({"error": {"message": "expired", "code": 190}}));
        transport.push_json(400, json!({"error": {"message": "bad", "code": 100}}));
        let api = api(transport);

        assert!(api.validate_token("t").await.unwrap());
        assert!(!api.validate_token("t").await.unwrap());
        assert!(matches!(
            api.validate_token("t").await,
            Err(AppError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn insights_read_values_and_total_value_shapes() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(
            200,
            json!({"data": [
                {"name": "impressions", "values": [{"value": 120}]},
                {"name": "reach", "total_value": {"value": 90}},
                {"name": "saved", "values": []}
            ]}),
        );

        let insights = api(transport).media_insights("t", "m1").await.unwrap();
        assert_eq!(
            insights,
            MediaInsights {
                impressions: Some(120),
                reach: Some(90),
                saved: None
            }
        );
    }

    #[test]
    fn authorize_url_carries_state_and_scopes() {
        let transport = Arc::new(ScriptedTransport::new());
        let url = api(transport).authorize_url("nonce-123").unwrap();
        assert!(url.starts_with("https://www.instagram.com/oauth/authorize?"));
        assert!(url.contains("state=nonce-123"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=app-id"));
    }

    #[test]
    fn parses_graph_timestamps() {
        let a = parse_graph_time("2024-05-01T12:00:00+0000").unwrap();
        let b = parse_graph_time("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(a, b);
        assert!(parse_graph_time("yesterday").is_none());
    }

    #[test]
    fn page_reports_next_link() {
        let page: Page<MediaRecord> = serde_json::from_value(json!({
            "data": [{"id": "m1"}],
            "paging": {"cursors": {"after": "x"}, "next": "https://graph.example/next"}
        }))
        .unwrap();
        assert_eq!(page.next_url(), Some("https://graph.example/next"));

        let last: Page<MediaRecord> = serde_json::from_value(json!({"data": []})).unwrap();
        assert_eq!(last.next_url(), None);
    }

    #[test]
    fn page_skips_records_that_do_not_decode() {
        let page: Page<MessageRecord> = serde_json::from_value(json!({
            "data": [
                {"id": "m1", "message": "hi"},
                {"message": "missing id"},
                {"id": "m3", "to": "not a list"}
            ]
        }))
        .unwrap();

        let ids: Vec<&str> = page.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1"]);
        assert_eq!(page.malformed, 2);
    }
}
