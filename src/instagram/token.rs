//! Token lifecycle
//!
//! OAuth code exchange, long-lived upgrade, proactive refresh and
//! validation. A token upstream rejects as invalid moves the account to
//! "needs reconnect" and every caller sees [`AppError::ReconnectRequired`].

use chrono::{Duration, Utc};
use std::sync::Arc;

use super::graph::{GraphApi, Profile};
use crate::data::{Account, Database, EntityId, Owner, TokenKind, TokenState, TokenValidationCache};
use crate::error::AppError;

/// Lifetime of a short-lived token as issued by the code exchange
const SHORT_LIVED_TTL_SECS: i64 = 3600;

pub struct TokenLifecycleManager {
    db: Arc<Database>,
    graph: Arc<GraphApi>,
    cache: Arc<TokenValidationCache>,
    require_long_lived: bool,
    lookahead: Duration,
    invalid_ttl_secs: u64,
}

/// Credential about to be stored
struct IssuedToken {
    access_token: String,
    kind: TokenKind,
    expires_at: chrono::DateTime<Utc>,
}

impl TokenLifecycleManager {
    pub fn new(
        db: Arc<Database>,
        graph: Arc<GraphApi>,
        cache: Arc<TokenValidationCache>,
        require_long_lived: bool,
        lookahead_days: i64,
        invalid_ttl_secs: u64,
    ) -> Self {
        Self {
            db,
            graph,
            cache,
            require_long_lived,
            lookahead: Duration::days(lookahead_days),
            invalid_ttl_secs,
        }
    }

    pub fn state_of(&self, account: &Account) -> TokenState {
        account.token_state(Utc::now(), self.lookahead)
    }

    /// Finish an OAuth round trip for `owner` and return the linked account.
    pub async fn complete_oauth(&self, code: &str, owner: &Owner) -> Result<Account, AppError> {
        let grant = self.graph.exchange_code(code).await?;
        let now = Utc::now();

        let issued = match self.graph.exchange_long_lived(&grant.access_token).await {
            Ok(long_lived) => IssuedToken {
                access_token: long_lived.access_token,
                kind: TokenKind::LongLived,
                expires_at: now + Duration::seconds(long_lived.expires_in),
            },
            Err(error) if self.require_long_lived => {
                tracing::warn!(%error, owner = %owner.key(), "Long-lived token exchange failed");
                return Err(AppError::Upstream(format!(
                    "long-lived token exchange failed: {}",
                    error
                )));
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    owner = %owner.key(),
                    "Long-lived token exchange failed, keeping short-lived token"
                );
                IssuedToken {
                    access_token: grant.access_token.clone(),
                    kind: TokenKind::ShortLived,
                    expires_at: now + Duration::seconds(SHORT_LIVED_TTL_SECS),
                }
            }
        };

        let profile = self.graph.fetch_profile(&issued.access_token).await?;
        let ig_user_id = profile
            .ig_user_id()
            .map(str::to_string)
            .unwrap_or_else(|| grant.user_id.clone());

        self.attach(owner, &ig_user_id, &profile, issued, grant.permissions)
            .await
    }

    /// Upsert the account for `owner`, refusing to take over another
    /// owner's Instagram identity.
    async fn attach(
        &self,
        owner: &Owner,
        ig_user_id: &str,
        profile: &Profile,
        issued: IssuedToken,
        scopes: Vec<String>,
    ) -> Result<Account, AppError> {
        if let Some(existing) = self.db.get_account_by_ig_user_id(ig_user_id).await? {
            if &existing.owner != owner {
                tracing::warn!(
                    ig_user_id,
                    existing_owner = %existing.owner.key(),
                    requested_owner = %owner.key(),
                    "Refusing to attach Instagram account owned by someone else"
                );
                return Err(AppError::OwnershipConflict);
            }
        }

        let now = Utc::now();
        match self.db.get_account_by_owner(owner).await? {
            Some(mut account) => {
                if account.access_token.is_some() && account.ig_user_id != ig_user_id {
                    tracing::info!(
                        account_id = %account.id,
                        previous = %account.ig_user_id,
                        ig_user_id,
                        "Owner switched to a different Instagram account"
                    );
                }
                if let Some(old_token) = &account.access_token {
                    self.cache.invalidate(&account.id, old_token).await;
                }
                account.ig_user_id = ig_user_id.to_string();
                apply_profile(&mut account, profile);
                account.access_token = Some(issued.access_token);
                account.token_kind = issued.kind;
                account.token_expires_at = Some(issued.expires_at);
                account.scopes = scopes;
                account.is_active = true;
                account.needs_reconnect = false;
                account.updated_at = now;

                self.db.update_account(&account).await?;
                tracing::info!(account_id = %account.id, owner = %owner.key(), "Instagram account reconnected");
                Ok(account)
            }
            None => {
                let mut account = Account {
                    id: EntityId::new().0,
                    owner: owner.clone(),
                    ig_user_id: ig_user_id.to_string(),
                    username: String::new(),
                    account_type: None,
                    access_token: Some(issued.access_token),
                    token_kind: issued.kind,
                    token_expires_at: Some(issued.expires_at),
                    scopes,
                    profile_picture_url: None,
                    followers_count: 0,
                    follows_count: 0,
                    media_count: 0,
                    last_synced_at: None,
                    is_active: true,
                    needs_reconnect: false,
                    created_at: now,
                    updated_at: now,
                };
                apply_profile(&mut account, profile);

                self.db.insert_account(&account).await?;
                tracing::info!(account_id = %account.id, owner = %owner.key(), "Instagram account connected");
                Ok(account)
            }
        }
    }

    /// Return a token that is safe to use for `account`, refreshing it when
    /// it is short-lived, near expiry or expired.
    ///
    /// A failed refresh is not fatal: the current token is validated and
    /// used if upstream still accepts it.
    pub async fn ensure_valid_token(&self, account: &mut Account) -> Result<String, AppError> {
        let state = self.state_of(account);
        if !account.is_active || state == TokenState::NoToken || state == TokenState::Revoked {
            return Err(AppError::ReconnectRequired);
        }
        let Some(mut token) = account.access_token.clone() else {
            return Err(AppError::ReconnectRequired);
        };

        if state.needs_refresh() {
            match self.refresh(account, &token, state).await {
                Ok(refreshed) => token = refreshed,
                Err(AppError::ReconnectRequired) => {
                    self.mark_needs_reconnect(account).await?;
                    return Err(AppError::ReconnectRequired);
                }
                Err(error) => {
                    tracing::warn!(
                        account_id = %account.id,
                        ?state,
                        %error,
                        "Token refresh failed, validating current token"
                    );
                }
            }
        }

        // Fresh upstream answer, if the cache had to ask.
        let mut fresh: Option<Result<bool, AppError>> = None;
        let slot = &mut fresh;
        let graph = &self.graph;
        let candidate = token.clone();
        let valid = self
            .cache
            .is_valid(&account.id, &token, move || async move {
                let result = graph.validate_token(&candidate).await;
                let valid = matches!(result, Ok(true));
                *slot = Some(result);
                valid
            })
            .await;

        if valid {
            return Ok(token);
        }

        match fresh {
            Some(Ok(_)) => {
                self.mark_needs_reconnect(account).await?;
                Err(AppError::ReconnectRequired)
            }
            // Upstream could not answer; the token may still be fine.
            Some(Err(error)) => Err(error),
            // Recent failed check still cached
            None => Err(AppError::ServiceUnavailable {
                retry_after_secs: self.invalid_ttl_secs.max(1),
            }),
        }
    }

    async fn refresh(
        &self,
        account: &mut Account,
        token: &str,
        state: TokenState,
    ) -> Result<String, AppError> {
        let refreshed = match account.token_kind {
            TokenKind::ShortLived => self.graph.exchange_long_lived(token).await?,
            TokenKind::LongLived => self.graph.refresh_token(token).await?,
        };
        let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in);

        self.db
            .update_account_token(
                &account.id,
                &refreshed.access_token,
                TokenKind::LongLived,
                Some(expires_at),
            )
            .await?;
        self.cache.invalidate(&account.id, token).await;

        tracing::info!(
            account_id = %account.id,
            ?state,
            expires_at = %expires_at,
            "Instagram token refreshed"
        );

        account.access_token = Some(refreshed.access_token.clone());
        account.token_kind = TokenKind::LongLived;
        account.token_expires_at = Some(expires_at);
        Ok(refreshed.access_token)
    }

    async fn mark_needs_reconnect(&self, account: &mut Account) -> Result<(), AppError> {
        tracing::warn!(account_id = %account.id, "Instagram token rejected, reconnect required");
        self.db.mark_account_needs_reconnect(&account.id).await?;
        account.needs_reconnect = true;
        Ok(())
    }

    /// Flag the account when a later call failed with an invalid-token error.
    pub async fn handle_rejection(&self, account: &mut Account, error: &AppError) {
        if !matches!(error, AppError::ReconnectRequired) || account.needs_reconnect {
            return;
        }
        if let Err(db_error) = self.mark_needs_reconnect(account).await {
            tracing::error!(account_id = %account.id, error = %db_error, "Failed to flag account for reconnect");
        }
    }
}

fn apply_profile(account: &mut Account, profile: &Profile) {
    account.username = profile.username.clone();
    account.account_type = profile.account_type.clone();
    account.profile_picture_url = profile.profile_picture_url.clone();
    account.followers_count = profile.followers_count;
    account.follows_count = profile.follows_count;
    account.media_count = profile.media_count;
}
