//! Self-imposed discovery search quota
//!
//! Usage is counted from persisted search events in a trailing window, so
//! it survives restarts and is shared by every session of an owner.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::QuotaConfig;
use crate::data::{Account, Database, Owner};
use crate::error::AppError;
use crate::instagram::GraphApi;
use crate::instagram::graph::BusinessProfile;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub window_days: i64,
    /// When the oldest counted search leaves the window
    pub resets_at: Option<DateTime<Utc>>,
}

pub struct QuotaService {
    db: Arc<Database>,
    graph: Arc<GraphApi>,
    limit: i64,
    window: Duration,
}

impl QuotaService {
    pub fn new(db: Arc<Database>, graph: Arc<GraphApi>, config: &QuotaConfig) -> Self {
        Self {
            db,
            graph,
            limit: config.search_limit,
            window: Duration::days(config.window_days),
        }
    }

    pub async fn usage(&self, owner: &Owner) -> Result<QuotaUsage, AppError> {
        self.usage_at(owner, Utc::now()).await
    }

    async fn usage_at(&self, owner: &Owner, now: DateTime<Utc>) -> Result<QuotaUsage, AppError> {
        let (used, oldest) = self
            .db
            .search_events_since(&owner.key(), now - self.window)
            .await?;

        Ok(QuotaUsage {
            used,
            limit: self.limit,
            remaining: (self.limit - used).max(0),
            window_days: self.window.num_days(),
            resets_at: oldest.map(|t| t + self.window),
        })
    }

    /// Look up a public professional profile, counting against the quota.
    ///
    /// A slot is reserved before the upstream call and given back if the
    /// call fails, so only searches that reach upstream are counted.
    pub async fn discover(
        &self,
        owner: &Owner,
        account: &Account,
        token: &str,
        username: &str,
    ) -> Result<Option<BusinessProfile>, AppError> {
        let now = Utc::now();
        let reservation = self
            .db
            .reserve_search_event(&owner.key(), username, now, now - self.window, self.limit)
            .await?;
        let Some(reservation) = reservation else {
            tracing::info!(owner = %owner.key(), limit = self.limit, "Discovery quota exhausted");
            return Err(AppError::RateLimited);
        };

        match self
            .graph
            .business_discovery(token, &account.ig_user_id, username)
            .await
        {
            Ok(profile) => Ok(profile),
            Err(error) => {
                if let Err(release_error) = self.db.release_search_event(&reservation).await {
                    tracing::warn!(%release_error, "Failed to release search reservation");
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixtures::{IG_USER_ID, fixture, stored_account};
    use serde_json::json;

    fn service(f: &crate::service::fixtures::Fixture, limit: i64) -> QuotaService {
        QuotaService::new(
            f.db.clone(),
            f.graph.clone(),
            &QuotaConfig {
                search_limit: limit,
                window_days: 7,
            },
        )
    }

    #[tokio::test]
    async fn counts_only_events_inside_the_window() {
        let f = fixture().await;
        let owner = Owner::User("u1".to_string());
        let now = Utc::now();
        f.db.record_search_event(&owner.key(), "old", now - Duration::days(8))
            .await
            .unwrap();
        let oldest_in_window = now - Duration::days(2);
        f.db.record_search_event(&owner.key(), "a", oldest_in_window)
            .await
            .unwrap();
        f.db.record_search_event(&owner.key(), "b", now - Duration::hours(1))
            .await
            .unwrap();
        f.db.record_search_event("user:someone-else", "c", now)
            .await
            .unwrap();

        let usage = service(&f, 50).usage_at(&owner, now).await.unwrap();

        assert_eq!(usage.used, 2);
        assert_eq!(usage.remaining, 48);
        assert_eq!(usage.window_days, 7);
        assert_eq!(
            usage.resets_at.map(|t| t.timestamp_millis()),
            Some((oldest_in_window + Duration::days(7)).timestamp_millis())
        );
    }

    #[tokio::test]
    async fn discovery_is_refused_once_quota_is_spent() {
        let f = fixture().await;
        let account = stored_account(&f.db).await;
        f.transport.route(
            "/17841400000000001",
            200,
            json!({"business_discovery": {"username": "brand", "followers_count": 10}, "id": IG_USER_ID}),
        );
        let quota = service(&f, 1);
        let token = account.access_token.clone().unwrap();

        let profile = quota
            .discover(&account.owner, &account, &token, "brand")
            .await
            .unwrap();
        assert_eq!(profile.unwrap().followers_count, 10);

        let second = quota.discover(&account.owner, &account, &token, "brand").await;
        assert!(matches!(second, Err(AppError::RateLimited)));
        assert_eq!(f.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_discoveries_cannot_overrun_the_quota() {
        let f = fixture().await;
        let account = stored_account(&f.db).await;
        f.transport.route(
            "/17841400000000001",
            200,
            json!({"business_discovery": {"username": "brand", "followers_count": 10}, "id": IG_USER_ID}),
        );
        let quota = service(&f, 1);
        let token = account.access_token.clone().unwrap();

        let (a, b) = tokio::join!(
            quota.discover(&account.owner, &account, &token, "brand"),
            quota.discover(&account.owner, &account, &token, "other"),
        );

        let granted = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 1);
        assert!([a, b].into_iter().any(|r| matches!(r, Err(AppError::RateLimited))));
        assert_eq!(quota.usage(&account.owner).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn failed_lookup_gives_the_slot_back() {
        let f = fixture().await;
        let account = stored_account(&f.db).await;
        f.transport
            .push_json(400, json!({"error": {"message": "bad", "code": 100}}));
        let quota = service(&f, 1);
        let token = account.access_token.clone().unwrap();

        let failed = quota.discover(&account.owner, &account, &token, "brand").await;
        assert!(failed.is_err());
        assert!(!matches!(failed, Err(AppError::RateLimited)));

        let usage = quota.usage(&account.owner).await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 1);
    }
}
