//! Business discovery and quota endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use super::connected_account;
use crate::AppState;
use crate::auth::CurrentOwner;
use crate::error::AppError;
use crate::instagram::graph::BusinessProfile;
use crate::service::{QuotaUsage, normalize_username};

pub fn discovery_router() -> Router<AppState> {
    Router::new()
        .route("/discovery/:username", get(discover))
        .route("/quota", get(quota))
}

/// GET /discovery/:username
///
/// Public profile of another professional account, counted against the
/// owner's weekly search quota.
async fn discover(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
    Path(username): Path<String>,
) -> Result<Json<BusinessProfile>, AppError> {
    let username = normalize_username(&username)
        .ok_or_else(|| AppError::Validation(format!("invalid username: {}", username)))?;

    let mut account = connected_account(&state, &owner).await?;
    let token = state.tokens.ensure_valid_token(&mut account).await?;

    let result = state
        .quota
        .discover(&owner, &account, &token, &username)
        .await;
    if let Err(error) = &result {
        state.tokens.handle_rejection(&mut account, error).await;
    }

    result?.map(Json).ok_or(AppError::NotFound)
}

/// GET /quota
async fn quota(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
) -> Result<Json<QuotaUsage>, AppError> {
    Ok(Json(state.quota.usage(&owner).await?))
}
