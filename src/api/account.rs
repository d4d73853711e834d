//! Connected account endpoints

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use serde::Serialize;

use super::owner_account;
use crate::AppState;
use crate::auth::CurrentOwner;
use crate::data::{Account, TokenState};
use crate::error::AppError;

pub fn account_router() -> Router<AppState> {
    Router::new().route("/account", get(get_account).delete(disconnect))
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    #[serde(flatten)]
    account: Account,
    token_state: TokenState,
    sync_in_progress: bool,
}

/// GET /account
async fn get_account(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
) -> Result<Json<AccountResponse>, AppError> {
    let account = owner_account(&state, &owner).await?;

    Ok(Json(AccountResponse {
        token_state: state.tokens.state_of(&account),
        sync_in_progress: state.active_syncs.is_active(&account.id),
        account,
    }))
}

/// DELETE /account
///
/// Soft disconnect: the token is dropped, stored messages and posts stay.
async fn disconnect(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
) -> Result<StatusCode, AppError> {
    let account = owner_account(&state, &owner).await?;
    if !state.db.disconnect_account(&account.id).await? {
        return Err(AppError::NotFound);
    }

    tracing::info!(account_id = %account.id, owner = %owner.key(), "Instagram account disconnected");
    Ok(StatusCode::NO_CONTENT)
}
