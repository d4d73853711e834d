//! Profile picture resolution
//!
//! Lookup order: a locally linked account with the same handle, then the
//! cache of earlier upstream lookups, then nothing. Misses are fetched in
//! the background with the requesting owner's own account, so callers never
//! wait on upstream and never spend another tenant's token.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{CacheConfig, ProfilePictureConfig};
use crate::data::{Account, Database, TtlCache};
use crate::error::AppError;
use crate::instagram::{GraphApi, TokenLifecycleManager};
use crate::tasks::BackgroundTasks;

const MAX_USERNAME_LEN: usize = 30;

/// Normalize a handle: trim, drop a leading `@`, lowercase.
///
/// Returns `None` for strings that cannot be Instagram usernames.
pub fn normalize_username(raw: &str) -> Option<String> {
    let username = raw.trim().trim_start_matches('@').to_lowercase();
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    valid.then_some(username)
}

#[derive(Clone)]
struct Fetcher {
    db: Arc<Database>,
    graph: Arc<GraphApi>,
    tokens: Arc<TokenLifecycleManager>,
    cache: Arc<TtlCache<String, Option<String>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    ttl: Duration,
    concurrency: usize,
    batch_delay: Duration,
}

pub struct ProfilePictureResolver {
    fetcher: Fetcher,
    tasks: BackgroundTasks,
    batch_cap: usize,
}

impl ProfilePictureResolver {
    pub fn new(
        db: Arc<Database>,
        graph: Arc<GraphApi>,
        tokens: Arc<TokenLifecycleManager>,
        tasks: BackgroundTasks,
        cache_config: &CacheConfig,
        config: &ProfilePictureConfig,
    ) -> Self {
        Self {
            fetcher: Fetcher {
                db,
                graph,
                tokens,
                cache: Arc::new(TtlCache::new("profile_picture", cache_config.max_entries)),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                ttl: Duration::from_secs(cache_config.profile_picture_ttl),
                concurrency: config.concurrency.max(1),
                batch_delay: Duration::from_millis(config.batch_delay_ms),
            },
            tasks,
            batch_cap: config.batch_cap,
        }
    }

    pub fn batch_cap(&self) -> usize {
        self.batch_cap
    }

    /// Resolve one handle without waiting on upstream.
    ///
    /// A miss is fetched with `account` when given; without one, only local
    /// data and the cache are consulted.
    pub async fn resolve(
        &self,
        raw: &str,
        account: Option<Account>,
    ) -> Result<Option<String>, AppError> {
        let username = normalize_username(raw)
            .ok_or_else(|| AppError::Validation(format!("invalid username: {}", raw)))?;

        match self.lookup(&username).await? {
            Some(resolved) => Ok(resolved),
            None => {
                self.schedule(account, vec![username]);
                Ok(None)
            }
        }
    }

    /// Resolve up to `batch_cap` handles; misses are fetched in the background.
    ///
    /// Keys of the result are normalized usernames. Invalid handles are skipped.
    pub async fn resolve_batch(
        &self,
        usernames: &[String],
        account: Option<Account>,
    ) -> Result<HashMap<String, Option<String>>, AppError> {
        if usernames.len() > self.batch_cap {
            return Err(AppError::Validation(format!(
                "at most {} usernames per request",
                self.batch_cap
            )));
        }

        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        for username in usernames.iter().filter_map(|u| normalize_username(u)) {
            if resolved.contains_key(&username) {
                continue;
            }
            match self.lookup(&username).await? {
                Some(url) => {
                    resolved.insert(username, url);
                }
                None => {
                    resolved.insert(username.clone(), None);
                    missing.push(username);
                }
            }
        }

        self.schedule(account, missing);
        Ok(resolved)
    }

    /// `Some(_)` when the local store or cache has an answer.
    async fn lookup(&self, username: &str) -> Result<Option<Option<String>>, AppError> {
        if let Some(url) = self
            .fetcher
            .db
            .find_profile_picture_by_username(username)
            .await?
        {
            return Ok(Some(Some(url)));
        }
        Ok(self.fetcher.cache.get(&username.to_string()).await)
    }

    fn schedule(&self, account: Option<Account>, usernames: Vec<String>) {
        let Some(account) = account else {
            return;
        };
        let claimed: Vec<String> = {
            let mut in_flight = lock(&self.fetcher.in_flight);
            usernames
                .into_iter()
                .filter(|u| in_flight.insert(u.clone()))
                .collect()
        };
        if claimed.is_empty() {
            return;
        }

        let fetcher = self.fetcher.clone();
        self.tasks
            .spawn("profile_picture_fetch", async move { fetcher.run(account, claimed).await });
    }
}

impl Fetcher {
    async fn run(self, mut account: Account, usernames: Vec<String>) -> Result<(), AppError> {
        let token = match self.tokens.ensure_valid_token(&mut account).await {
            Ok(token) => token,
            Err(error) => {
                tracing::debug!(account_id = %account.id, %error, "No usable token for profile picture lookups");
                self.release(&usernames);
                return Ok(());
            }
        };

        let batches: Vec<&[String]> = usernames.chunks(self.concurrency).collect();
        let last = batches.len().saturating_sub(1);
        for (index, batch) in batches.iter().enumerate() {
            let lookups = batch
                .iter()
                .map(|username| self.fetch_one(&token, &account.ig_user_id, username));
            let results = futures::future::join_all(lookups).await;

            if let Some(rejected) = results
                .into_iter()
                .find(|r| matches!(r, Err(AppError::ReconnectRequired)))
                .and_then(Result::err)
            {
                self.tokens.handle_rejection(&mut account, &rejected).await;
                for rest in &batches[index + 1..] {
                    self.release(rest);
                }
                return Ok(());
            }

            if index < last {
                self.graph.client().sleeper().sleep(self.batch_delay).await;
            }
        }
        Ok(())
    }

    async fn fetch_one(&self, token: &str, ig_user_id: &str, username: &str) -> Result<(), AppError> {
        let result = match self.graph.business_discovery(token, ig_user_id, username).await {
            Ok(profile) => {
                let url = profile.and_then(|p| p.profile_picture_url);
                self.cache.insert(username.to_string(), url, self.ttl).await;
                Ok(())
            }
            Err(error) => {
                // Not cached, so the next request retries.
                tracing::debug!(username, %error, "Profile picture lookup failed");
                Err(error)
            }
        };
        lock(&self.in_flight).remove(username);
        result
    }

    fn release(&self, usernames: &[String]) {
        let mut in_flight = lock(&self.in_flight);
        for username in usernames {
            in_flight.remove(username);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
