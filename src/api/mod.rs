//! API layer
//!
//! HTTP handlers for:
//! - Webhook verification and ingestion
//! - Account, sync, conversation and lookup endpoints
//! - Metrics (Prometheus)

mod account;
mod conversations;
mod discovery;
pub mod metrics;
mod profile_pictures;
mod sync;
mod webhooks;

use axum::Router;

use crate::AppState;
use crate::data::{Account, Owner};
use crate::error::AppError;

pub use metrics::{metrics_router, track_requests};
pub use webhooks::webhook_router;

/// Owner-scoped endpoints; all require a session.
pub fn app_router() -> Router<AppState> {
    Router::new()
        .merge(account::account_router())
        .merge(sync::sync_router())
        .merge(conversations::conversations_router())
        .merge(profile_pictures::profile_pictures_router())
        .merge(discovery::discovery_router())
}

/// The owner's linked account, whatever its state.
async fn owner_account(state: &AppState, owner: &Owner) -> Result<Account, AppError> {
    state
        .db
        .get_account_by_owner(owner)
        .await?
        .ok_or(AppError::NotFound)
}

/// The owner's account, refusing disconnected or revoked ones.
async fn connected_account(state: &AppState, owner: &Owner) -> Result<Account, AppError> {
    let account = owner_account(state, owner).await?;
    if !account.is_active || account.needs_reconnect {
        return Err(AppError::ReconnectRequired);
    }
    Ok(account)
}
