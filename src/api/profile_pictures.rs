//! Profile picture lookups
//!
//! Answers come from local data or cache; misses return `null` and are
//! fetched in the background, with the caller's own account, for the next
//! request.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::connected_account;
use crate::AppState;
use crate::auth::CurrentOwner;
use crate::data::{Account, Owner};
use crate::error::AppError;
use crate::service::normalize_username;

pub fn profile_pictures_router() -> Router<AppState> {
    Router::new()
        .route("/profile-pictures", post(resolve_batch))
        .route("/profile-pictures/:username", get(resolve_one))
}

#[derive(Debug, Serialize)]
struct ProfilePictureResponse {
    username: String,
    profile_picture_url: Option<String>,
}

/// Account used for background lookups; owners without a usable one get
/// local answers only.
async fn lookup_account(state: &AppState, owner: &Owner) -> Result<Option<Account>, AppError> {
    match connected_account(state, owner).await {
        Ok(account) => Ok(Some(account)),
        Err(AppError::NotFound | AppError::ReconnectRequired) => Ok(None),
        Err(error) => Err(error),
    }
}

/// GET /profile-pictures/:username
async fn resolve_one(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
    Path(username): Path<String>,
) -> Result<Json<ProfilePictureResponse>, AppError> {
    let account = lookup_account(&state, &owner).await?;
    let profile_picture_url = state.profile_pictures.resolve(&username, account).await?;

    Ok(Json(ProfilePictureResponse {
        username: normalize_username(&username).unwrap_or(username),
        profile_picture_url,
    }))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    usernames: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    profile_pictures: HashMap<String, Option<String>>,
}

/// POST /profile-pictures
async fn resolve_batch(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    let account = lookup_account(&state, &owner).await?;
    let profile_pictures = state
        .profile_pictures
        .resolve_batch(&request.usernames, account)
        .await?;
    Ok(Json(BatchResponse { profile_pictures }))
}
