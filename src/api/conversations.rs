//! Conversation endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;

use super::owner_account;
use crate::AppState;
use crate::auth::CurrentOwner;
use crate::data::ConversationSummary;
use crate::error::AppError;

pub fn conversations_router() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/:id/read", post(mark_read))
}

/// GET /conversations
///
/// Newest first. Works for disconnected accounts too; stored history stays readable.
async fn list_conversations(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
) -> Result<Json<Vec<ConversationSummary>>, AppError> {
    let account = owner_account(&state, &owner).await?;
    let summaries = state.projector.list_conversations(&account.id).await?;
    Ok(Json(summaries))
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    conversation_id: String,
    updated: u64,
}

/// POST /conversations/:id/read
async fn mark_read(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
    Path(conversation_id): Path<String>,
) -> Result<Json<MarkReadResponse>, AppError> {
    let account = owner_account(&state, &owner).await?;
    let updated = state
        .projector
        .mark_read(&account.id, &conversation_id)
        .await?;

    Ok(Json(MarkReadResponse {
        conversation_id,
        updated,
    }))
}
