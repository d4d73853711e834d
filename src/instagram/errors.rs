//! Graph API error classification
//!
//! Upstream errors arrive as
//! `{"error": {"message", "type", "code", "error_subcode", "is_transient"}}`.

use serde::Deserialize;

use super::client::{GraphResponse, RetryOutcome};
use crate::error::AppError;

/// Application-level rate limit codes
const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613];
/// Codes the upstream documents as "temporary, retry"
const TRANSIENT_CODES: &[i64] = &[1, 2];
const INVALID_TOKEN_CODE: i64 = 190;
const INVALID_TOKEN_SUBCODES: std::ops::RangeInclusive<i64> = 458..=467;
const PERMISSION_CODE: i64 = 10;
const PERMISSION_CODES: std::ops::RangeInclusive<i64> = 200..=299;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub is_transient: bool,
}

#[derive(Deserialize)]
struct Envelope {
    error: GraphErrorBody,
}

impl GraphErrorBody {
    /// Parse the structured error from a response body, if present.
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str::<Envelope>(body).ok().map(|e| e.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    TokenInvalid,
    Permission,
    Other,
}

/// Classify a response; `None` means success.
///
/// A 200 carrying an error envelope is still an error.
pub fn classify_response(response: &GraphResponse) -> Option<ErrorClass> {
    let error = GraphErrorBody::parse(&response.body);
    if response.is_success() && error.is_none() {
        return None;
    }
    Some(classify(response.status, error.as_ref()))
}

fn classify(status: u16, error: Option<&GraphErrorBody>) -> ErrorClass {
    let code = error.and_then(|e| e.code);
    let subcode = error.and_then(|e| e.error_subcode);

    if status == 429 || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
        return ErrorClass::RateLimited;
    }
    if code == Some(INVALID_TOKEN_CODE)
        || subcode.is_some_and(|s| INVALID_TOKEN_SUBCODES.contains(&s))
    {
        return ErrorClass::TokenInvalid;
    }
    if code.is_some_and(|c| c == PERMISSION_CODE || PERMISSION_CODES.contains(&c)) {
        return ErrorClass::Permission;
    }
    if error.is_some_and(|e| e.is_transient)
        || code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
        || matches!(status, 502..=504)
    {
        return ErrorClass::Transient;
    }
    ErrorClass::Other
}

fn error_message(response: &GraphResponse) -> String {
    match GraphErrorBody::parse(&response.body) {
        Some(error) if !error.message.is_empty() => error.message,
        _ => format!("HTTP {}", response.status),
    }
}

/// Turn a failed response into the caller-facing error kind.
pub fn response_error(response: &GraphResponse, rate_limit_secs: u64) -> AppError {
    match classify_response(response) {
        None => AppError::Upstream(format!("unexpected response (HTTP {})", response.status)),
        Some(ErrorClass::RateLimited) | Some(ErrorClass::Transient) => {
            AppError::ServiceUnavailable {
                retry_after_secs: rate_limit_secs,
            }
        }
        Some(ErrorClass::TokenInvalid) => AppError::ReconnectRequired,
        Some(ErrorClass::Permission) => AppError::PermissionDenied(error_message(response)),
        Some(ErrorClass::Other) => AppError::Upstream(error_message(response)),
    }
}

impl RetryOutcome {
    /// Unwrap a success or map the failure onto [`AppError`].
    pub fn into_result(self, rate_limit_secs: u64) -> Result<GraphResponse, AppError> {
        match self {
            RetryOutcome::Success(response) => Ok(response),
            RetryOutcome::Rejected(response) | RetryOutcome::Exhausted(response) => {
                Err(response_error(&response, rate_limit_secs))
            }
            RetryOutcome::NetworkFailure(error) => Err(AppError::Connectivity(error.0)),
        }
    }

    /// Whether the final upstream answer says the token is unusable.
    pub fn is_token_invalid(&self) -> bool {
        match self {
            RetryOutcome::Rejected(response) | RetryOutcome::Exhausted(response) => {
                classify_response(response) == Some(ErrorClass::TokenInvalid)
            }
            _ => false,
        }
    }
}
