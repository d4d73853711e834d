//! Data models
//!
//! Rust structs representing database entities and derived read models.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Owner
// =============================================================================

/// The application principal an Instagram account is linked to.
///
/// An account belongs to exactly one user or one company, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Owner {
    User(String),
    Company(String),
}

impl Owner {
    pub fn kind(&self) -> &'static str {
        match self {
            Owner::User(_) => "user",
            Owner::Company(_) => "company",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Owner::User(id) | Owner::Company(id) => id,
        }
    }

    /// Rebuild an owner from its stored `(kind, id)` pair.
    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "user" => Some(Owner::User(id)),
            "company" => Some(Owner::Company(id)),
            _ => None,
        }
    }

    /// Stable string key, used for per-owner channels and quota rows.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }
}

// =============================================================================
// Account
// =============================================================================

/// How the stored access token was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    ShortLived,
    LongLived,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::ShortLived => "short_lived",
            TokenKind::LongLived => "long_lived",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "long_lived" => TokenKind::LongLived,
            _ => TokenKind::ShortLived,
        }
    }
}

/// Lifecycle state of an account's credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    NoToken,
    ShortLived,
    LongLived,
    ExpiringSoon,
    Expired,
    Revoked,
}

impl TokenState {
    /// Whether a refresh should be attempted before using the token.
    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            TokenState::ShortLived | TokenState::ExpiringSoon | TokenState::Expired
        )
    }
}

/// One Instagram identity linked to an owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub owner: Owner,
    /// Instagram-scoped user id (globally unique)
    pub ig_user_id: String,
    pub username: String,
    /// "BUSINESS" / "MEDIA_CREATOR" as reported upstream
    pub account_type: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub token_kind: TokenKind,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub profile_picture_url: Option<String>,
    pub followers_count: i64,
    pub follows_count: i64,
    pub media_count: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub needs_reconnect: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Compute the token state relative to `now`.
    pub fn token_state(&self, now: DateTime<Utc>, lookahead: Duration) -> TokenState {
        if self.needs_reconnect {
            return TokenState::Revoked;
        }
        if self.access_token.is_none() {
            return TokenState::NoToken;
        }
        match self.token_expires_at {
            Some(expires_at) if expires_at <= now => TokenState::Expired,
            Some(expires_at) if expires_at <= now + lookahead => match self.token_kind {
                TokenKind::ShortLived => TokenState::ShortLived,
                TokenKind::LongLived => TokenState::ExpiringSoon,
            },
            _ => match self.token_kind {
                TokenKind::ShortLived => TokenState::ShortLived,
                TokenKind::LongLived => TokenState::LongLived,
            },
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// Kind of direct message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Share,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::File => "file",
            MessageType::Share => "share",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "image" => MessageType::Image,
            "video" => MessageType::Video,
            "audio" => MessageType::Audio,
            "file" => MessageType::File,
            "share" => MessageType::Share,
            _ => MessageType::Text,
        }
    }
}

/// A message attachment as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
}

/// One direct message
///
/// `(account_id, ig_message_id)` is unique. Rows are immutable apart
/// from `is_read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub conversation_id: String,
    pub ig_message_id: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub recipient_id: String,
    pub recipient_username: Option<String>,
    pub body: Option<String>,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub is_incoming: bool,
    pub is_read: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Post
// =============================================================================

/// One piece of owned media
///
/// `(account_id, ig_media_id)` is unique; counters refresh on resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub account_id: String,
    pub ig_media_id: String,
    pub media_type: String,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub permalink: Option<String>,
    pub caption: Option<String>,
    pub like_count: i64,
    pub comments_count: i64,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub saved: Option<i64>,
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Conversation (derived)
// =============================================================================

/// The other side of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counterparty {
    pub ig_user_id: String,
    pub username: Option<String>,
}

/// Per-conversation summary computed from stored messages
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub counterparty: Option<Counterparty>,
    pub message_count: usize,
    pub incoming_count: usize,
    pub unread_count: usize,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_incoming_at: Option<DateTime<Utc>>,
}
