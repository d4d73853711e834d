//! Session management
//!
//! Uses HMAC-signed tokens stored in cookies or sent as Bearer tokens.
//! No server-side session storage needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Owner;
use crate::error::AppError;

/// Name of the cookie carrying the session token
pub const SESSION_COOKIE: &str = "session";

/// Authenticated application principal
///
/// Issued by the host application. A user optionally acts on behalf of
/// one company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub company_id: Option<String>,
    /// When session was created
    pub created_at: DateTime<Utc>,
    /// When session expires
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, company_id: Option<String>, max_age_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            company_id,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(max_age_secs),
        }
    }

    /// Check if session is expired
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// Resolve the owner a request acts for.
    ///
    /// `None` and `"user"` select the user; `"company"` requires the
    /// session to carry a company.
    pub fn owner(&self, kind: Option<&str>) -> Result<Owner, AppError> {
        match kind.unwrap_or("user") {
            "user" => Ok(Owner::User(self.user_id.clone())),
            "company" => self
                .company_id
                .clone()
                .map(Owner::Company)
                .ok_or(AppError::Forbidden),
            other => Err(AppError::Validation(format!(
                "owner must be 'user' or 'company', got '{}'",
                other
            ))),
        }
    }
}

type HmacSha256 = hmac::Hmac<sha2::Sha256>;

fn mac(secret: &str) -> Result<HmacSha256, AppError> {
    use hmac::Mac;
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Config(format!("session secret: {}", e)))
}

/// Create a signed session token
///
/// Token format: base64(payload).base64(hmac_sha256(payload))
pub fn create_session_token(session: &Session, secret: &str) -> Result<String, AppError> {
    use base64::{Engine as _, engine::general_purpose};
    use hmac::Mac;

    let payload = serde_json::to_string(session).map_err(|e| AppError::Internal(e.into()))?;
    let payload_b64 = general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes());

    let mut mac = mac(secret)?;
    mac.update(payload_b64.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = general_purpose::URL_SAFE_NO_PAD.encode(signature);

    Ok(format!("{}.{}", payload_b64, signature_b64))
}

/// Verify and decode a session token
///
/// # Errors
/// `Unauthorized` if the token is malformed, forged or expired
pub fn verify_session_token(token: &str, secret: &str) -> Result<Session, AppError> {
    use base64::{Engine as _, engine::general_purpose};
    use hmac::Mac;

    let (payload_b64, signature_b64) = token.split_once('.').ok_or(AppError::Unauthorized)?;

    let signature = general_purpose::URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AppError::Unauthorized)?;
    let mut mac = mac(secret)?;
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AppError::Unauthorized)?;

    let payload = general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::Unauthorized)?;
    let session: Session =
        serde_json::from_slice(&payload).map_err(|_| AppError::Unauthorized)?;

    if session.is_expired() {
        return Err(AppError::Unauthorized);
    }
    Ok(session)
}
