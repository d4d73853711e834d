//! Sync trigger and progress endpoints
//!
//! Triggers return 202 immediately; the run continues as a supervised
//! background task and reports through `GET /sync/events`.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use chrono::{Duration, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;

use super::connected_account;
use crate::AppState;
use crate::auth::CurrentOwner;
use crate::data::{Account, Owner};
use crate::error::AppError;
use crate::service::SyncPlan;

const MAX_CUTOFF_DAYS: i64 = 3650;

pub fn sync_router() -> Router<AppState> {
    Router::new()
        .route("/sync", post(start_sync))
        .route("/sync/history", post(start_history_sync))
        .route("/sync/events", get(sync_events))
}

#[derive(Debug, Serialize)]
struct SyncAccepted {
    status: &'static str,
    account_id: String,
    kind: &'static str,
}

fn spawn_sync(
    state: &AppState,
    owner: &Owner,
    account: &Account,
    plan: SyncPlan,
) -> Result<(), AppError> {
    let permit = state
        .active_syncs
        .try_acquire(&account.id)
        .ok_or_else(|| AppError::Conflict("a sync is already running for this account".to_string()))?;

    let engine = state.sync.clone();
    let sink = state.progress.sink(&owner.key());
    let account_id = account.id.clone();
    tracing::info!(account_id = %account_id, owner = %owner.key(), ?plan, "Sync started");

    state.tasks.spawn("sync", async move {
        engine.run(&account_id, plan, sink, permit).await
    });
    Ok(())
}

/// POST /sync
async fn start_sync(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
) -> Result<(StatusCode, Json<SyncAccepted>), AppError> {
    let account = connected_account(&state, &owner).await?;
    spawn_sync(&state, &owner, &account, SyncPlan::Full)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAccepted {
            status: "started",
            account_id: account.id,
            kind: "full",
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    cutoff_days: Option<i64>,
}

/// POST /sync/history?cutoff_days=N
async fn start_history_sync(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
    Query(params): Query<HistoryParams>,
) -> Result<(StatusCode, Json<SyncAccepted>), AppError> {
    let days = params
        .cutoff_days
        .unwrap_or(state.config.sync.history_cutoff_days);
    if !(1..=MAX_CUTOFF_DAYS).contains(&days) {
        return Err(AppError::Validation(format!(
            "cutoff_days must be between 1 and {}",
            MAX_CUTOFF_DAYS
        )));
    }

    let account = connected_account(&state, &owner).await?;
    let cutoff = Utc::now() - Duration::days(days);
    spawn_sync(&state, &owner, &account, SyncPlan::History { cutoff })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAccepted {
            status: "started",
            account_id: account.id,
            kind: "history",
        }),
    ))
}

/// GET /sync/events
///
/// Progress of the owner's syncs as Server-Sent Events named `progress`.
async fn sync_events(
    State(state): State<AppState>,
    CurrentOwner { owner, .. }: CurrentOwner,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.progress.subscribe(&owner.key());

    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => Event::default().event("progress").json_data(&event).ok().map(Ok),
        // Lagged subscribers skip ahead.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
