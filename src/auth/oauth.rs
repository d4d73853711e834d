//! Instagram OAuth flow
//!
//! Authorization code flow for linking an Instagram professional account
//! to the session's user or company. Both endpoints are browser
//! navigations, so outcomes are reported as redirect query parameters.

use axum::{
    Router,
    extract::{Query, State},
    response::Redirect,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use super::middleware::CurrentUser;
use crate::AppState;
use crate::data::{Owner, TtlCache};
use crate::error::AppError;

/// How long a started flow may take before its state is rejected
pub const STATE_TTL: Duration = Duration::from_secs(300);

const NONCE_BYTES: usize = 32;

/// Create authentication router
///
/// Routes:
/// - GET /auth/instagram - Redirect to Instagram
/// - GET /auth/instagram/callback - OAuth callback
pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/auth/instagram", get(instagram_redirect))
        .route("/auth/instagram/callback", get(instagram_callback))
}

// =============================================================================
// State store
// =============================================================================

/// One started OAuth flow
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthState {
    pub nonce: String,
    pub owner: Owner,
    /// Relative path the browser returns to
    pub return_to: String,
    pub issued_at: DateTime<Utc>,
}

/// Single-use, time-bounded store of started flows
pub struct OAuthStateStore {
    states: TtlCache<String, OAuthState>,
    ttl: Duration,
}

impl OAuthStateStore {
    pub fn new(max_entries: usize) -> Self {
        Self::with_ttl(max_entries, STATE_TTL)
    }

    pub fn with_ttl(max_entries: usize, ttl: Duration) -> Self {
        Self {
            states: TtlCache::new("oauth_state", max_entries),
            ttl,
        }
    }

    pub async fn issue(&self, owner: Owner, return_to: Option<&str>) -> Result<OAuthState, AppError> {
        let state = OAuthState {
            nonce: generate_nonce(),
            owner,
            return_to: sanitize_return_to(return_to)?,
            issued_at: Utc::now(),
        };
        self.states
            .insert(state.nonce.clone(), state.clone(), self.ttl)
            .await;
        Ok(state)
    }

    /// Consume the flow for `nonce`. A nonce works at most once.
    pub async fn take(&self, nonce: &str) -> Result<OAuthState, AppError> {
        self.take_if(nonce, |_| true).await
    }

    /// Consume the flow for `nonce` only if `accept` approves it.
    ///
    /// A rejected flow stays stored, so its rightful session can still
    /// finish it.
    pub async fn take_if<F>(&self, nonce: &str, accept: F) -> Result<OAuthState, AppError>
    where
        F: FnOnce(&OAuthState) -> bool,
    {
        let key = nonce.to_string();
        let pending = self
            .states
            .get(&key)
            .await
            .ok_or_else(|| AppError::InvalidOAuthState("unknown or expired state".to_string()))?;
        if !accept(&pending) {
            return Err(AppError::InvalidOAuthState(
                "state belongs to another session".to_string(),
            ));
        }

        let state = self
            .states
            .take(&key)
            .await
            .ok_or_else(|| AppError::InvalidOAuthState("state already used".to_string()))?;

        let age = Utc::now().signed_duration_since(state.issued_at);
        if age.num_milliseconds() > self.ttl.as_millis() as i64 {
            return Err(AppError::InvalidOAuthState("state expired".to_string()));
        }
        Ok(state)
    }
}

fn generate_nonce() -> String {
    use base64::{Engine as _, engine::general_purpose};
    use rand::RngCore;

    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Accept only same-origin relative paths.
fn sanitize_return_to(return_to: Option<&str>) -> Result<String, AppError> {
    let Some(path) = return_to.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok("/".to_string());
    };
    let relative = path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.contains("://");
    if !relative {
        return Err(AppError::Validation(
            "return_to must be a relative path".to_string(),
        ));
    }
    Ok(path.to_string())
}

/// Append outcome parameters to a relative path.
fn outcome_url(return_to: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if return_to.contains('?') { '&' } else { '?' };
    format!("{}{}{}", return_to, separator, query)
}

fn error_redirect(return_to: &str, error: &AppError) -> Redirect {
    Redirect::to(&outcome_url(
        return_to,
        &[("instagram", "error"), ("reason", error.kind())],
    ))
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct StartQuery {
    owner: Option<String>,
    return_to: Option<String>,
}

/// GET /auth/instagram
///
/// Stores a fresh state for the session's chosen owner and redirects to
/// the Instagram authorization dialog.
async fn instagram_redirect(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Query(query): Query<StartQuery>,
) -> Result<Redirect, AppError> {
    let owner = session.owner(query.owner.as_deref())?;
    let flow = state
        .oauth_states
        .issue(owner, query.return_to.as_deref())
        .await?;

    tracing::info!(owner = %flow.owner.key(), "Starting Instagram OAuth");
    let url = state.graph.authorize_url(&flow.nonce)?;
    Ok(Redirect::to(&url))
}

/// Query parameters from the Instagram callback
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_reason: Option<String>,
}

/// GET /auth/instagram/callback
///
/// # Steps
/// 1. Check the stored state belongs to this session, then consume it
/// 2. Exchange the code and link the account
/// 3. Redirect back with `instagram=connected` or `instagram=error&reason=<kind>`
async fn instagram_callback(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let belongs_to_session =
        |flow: &OAuthState| session.owner(Some(flow.owner.kind())).ok().as_ref() == Some(&flow.owner);
    let flow = match query.state.as_deref() {
        Some(nonce) => state.oauth_states.take_if(nonce, belongs_to_session).await,
        None => Err(AppError::InvalidOAuthState("missing state".to_string())),
    };
    let flow = match flow {
        Ok(flow) => flow,
        Err(error) => {
            tracing::warn!(user_id = %session.user_id, %error, "Rejected OAuth callback");
            return error_redirect("/", &error);
        }
    };

    if let Some(denied) = query.error.as_deref() {
        tracing::info!(
            owner = %flow.owner.key(),
            error = denied,
            reason = ?query.error_reason,
            "Instagram authorization declined"
        );
        return Redirect::to(&outcome_url(
            &flow.return_to,
            &[("instagram", "error"), ("reason", "access_denied")],
        ));
    }
    let Some(code) = query.code.as_deref() else {
        return error_redirect(
            &flow.return_to,
            &AppError::Validation("missing code".to_string()),
        );
    };

    match state.tokens.complete_oauth(code, &flow.owner).await {
        Ok(account) => Redirect::to(&outcome_url(
            &flow.return_to,
            &[("instagram", "connected"), ("username", &account.username)],
        )),
        Err(error) => {
            tracing::warn!(owner = %flow.owner.key(), %error, "Instagram OAuth failed");
            error_redirect(&flow.return_to, &error)
        }
    }
}
