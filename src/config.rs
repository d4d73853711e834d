//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub instagram: InstagramConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub profile_pictures: ProfilePictureConfig,
    pub quota: QuotaConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public base URL of the application (e.g., "https://app.example.com")
    pub public_url: String,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Session secret key (32+ bytes)
    pub session_secret: String,
    /// Session max age in seconds (default: 604800 = 7 days)
    pub session_max_age: i64,
}

/// Instagram app credentials and endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct InstagramConfig {
    pub app_id: String,
    pub app_secret: String,
    /// OAuth redirect URI registered with the app
    pub redirect_uri: String,
    /// Scopes requested during OAuth
    pub scopes: Vec<String>,
    /// Authorization dialog URL
    pub authorize_url: String,
    /// Base URL for the code exchange endpoint
    pub oauth_base_url: String,
    /// Base URL for Graph API calls
    pub graph_base_url: String,
    /// Graph API version path segment (e.g., "v21.0")
    pub api_version: String,
    /// Accepted `hub.verify_token` values for webhook subscription
    #[serde(default)]
    pub webhook_verify_tokens: Vec<String>,
    /// HMAC secrets accepted for `X-Hub-Signature-256`, newest first
    #[serde(default)]
    pub webhook_secrets: Vec<String>,
    /// Fail the OAuth callback when the long-lived exchange fails
    #[serde(default)]
    pub require_long_lived_token: bool,
}

/// Retry policy for outbound Graph API calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fixed wait after a rate-limit response
    pub rate_limit_delay_ms: u64,
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }
}

/// Sync engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Items requested per page
    pub page_size: u32,
    /// Hard cap on pages fetched per run
    pub max_pages: u32,
    /// Default history cutoff in days
    pub history_cutoff_days: i64,
    /// Pages fetched before inter-page throttling kicks in
    pub throttle_after_pages: u32,
    /// Delay inserted between pages once throttling is active
    pub page_delay_ms: u64,
    /// Emit an item progress event every N processed items
    pub progress_every: usize,
    /// Refresh tokens expiring within this many days
    pub refresh_lookahead_days: i64,
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for successful token validations in seconds
    pub token_valid_ttl: u64,
    /// TTL for failed token validations in seconds
    pub token_invalid_ttl: u64,
    /// Maximum entries held by each in-memory cache
    pub max_entries: usize,
    /// Profile picture cache TTL in seconds
    pub profile_picture_ttl: u64,
}

/// Profile picture resolution
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilePictureConfig {
    /// Maximum usernames accepted by the batch endpoint
    pub batch_cap: usize,
    /// Background fetches run concurrently per batch
    pub concurrency: usize,
    /// Delay between background batches
    pub batch_delay_ms: u64,
}

/// Self-imposed discovery search quota
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Searches allowed per window
    pub search_limit: i64,
    /// Trailing window length in days
    pub window_days: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (CREATORSYNC__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.public_url", "http://localhost:8080")?
            .set_default("auth.session_max_age", 604800)?
            .set_default(
                "instagram.scopes",
                vec![
                    "instagram_business_basic",
                    "instagram_business_manage_messages",
                    "instagram_business_manage_insights",
                ],
            )?
            .set_default(
                "instagram.authorize_url",
                "https://www.instagram.com/oauth/authorize",
            )?
            .set_default("instagram.oauth_base_url", "https://api.instagram.com")?
            .set_default("instagram.graph_base_url", "https://graph.instagram.com")?
            .set_default("instagram.api_version", "v21.0")?
            .set_default("instagram.require_long_lived_token", false)?
            .set_default("retry.max_retries", 3)?
            .set_default("retry.initial_delay_ms", 1000)?
            .set_default("retry.max_delay_ms", 30000)?
            .set_default("retry.rate_limit_delay_ms", 60000)?
            .set_default("sync.page_size", 50)?
            .set_default("sync.max_pages", 100)?
            .set_default("sync.history_cutoff_days", 365)?
            .set_default("sync.throttle_after_pages", 5)?
            .set_default("sync.page_delay_ms", 500)?
            .set_default("sync.progress_every", 25)?
            .set_default("sync.refresh_lookahead_days", 7)?
            .set_default("cache.token_valid_ttl", 300)?
            .set_default("cache.token_invalid_ttl", 30)?
            .set_default("cache.max_entries", 10000)?
            .set_default("cache.profile_picture_ttl", 86400)?
            .set_default("profile_pictures.batch_cap", 100)?
            .set_default("profile_pictures.concurrency", 5)?
            .set_default("profile_pictures.batch_delay_ms", 1000)?
            .set_default("quota.search_limit", 50)?
            .set_default("quota.window_days", 7)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("CREATORSYNC")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("instagram.scopes")
                    .with_list_parse_key("instagram.webhook_verify_tokens")
                    .with_list_parse_key("instagram.webhook_secrets")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;
        const MIN_SESSION_SECRET_BYTES: usize = 32;

        if self.auth.session_secret.len() < MIN_SESSION_SECRET_BYTES {
            return Err(AppError::Config(format!(
                "auth.session_secret must be at least {} bytes",
                MIN_SESSION_SECRET_BYTES
            )));
        }

        if self.auth.session_max_age <= 0 {
            return Err(AppError::Config(
                "auth.session_max_age must be greater than 0".to_string(),
            ));
        }

        if self.instagram.app_id.trim().is_empty() || self.instagram.app_secret.trim().is_empty()
        {
            return Err(AppError::Config(
                "instagram.app_id and instagram.app_secret are required".to_string(),
            ));
        }

        url::Url::parse(&self.instagram.redirect_uri).map_err(|e| {
            AppError::Config(format!("instagram.redirect_uri is not a valid URL: {}", e))
        })?;

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }

        if self.sync.max_pages == 0 || self.sync.page_size == 0 {
            return Err(AppError::Config(
                "sync.max_pages and sync.page_size must be greater than 0".to_string(),
            ));
        }

        if self.instagram.webhook_secrets.is_empty() {
            tracing::warn!(
                "instagram.webhook_secrets is empty; webhook deliveries will not be signature-checked"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                public_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/creatorsync-test.db"),
            },
            auth: AuthConfig {
                session_secret: "x".repeat(32),
                session_max_age: 604_800,
            },
            instagram: InstagramConfig {
                app_id: "app-id".to_string(),
                app_secret: "app-secret".to_string(),
                redirect_uri: "http://localhost:8080/auth/instagram/callback".to_string(),
                scopes: vec!["instagram_business_basic".to_string()],
                authorize_url: "https://www.instagram.com/oauth/authorize".to_string(),
                oauth_base_url: "https://api.instagram.com".to_string(),
                graph_base_url: "https://graph.instagram.com".to_string(),
                api_version: "v21.0".to_string(),
                webhook_verify_tokens: vec!["verify-me".to_string()],
                webhook_secrets: vec!["secret-one".to_string()],
                require_long_lived_token: false,
            },
            retry: RetryConfig {
                max_retries: 3,
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
                rate_limit_delay_ms: 60_000,
            },
            sync: SyncConfig {
                page_size: 50,
                max_pages: 100,
                history_cutoff_days: 365,
                throttle_after_pages: 5,
                page_delay_ms: 500,
                progress_every: 25,
                refresh_lookahead_days: 7,
            },
            cache: CacheConfig {
                token_valid_ttl: 300,
                token_invalid_ttl: 30,
                max_entries: 10_000,
                profile_picture_ttl: 86_400,
            },
            profile_pictures: ProfilePictureConfig {
                batch_cap: 100,
                concurrency: 5,
                batch_delay_ms: 1000,
            },
            quota: QuotaConfig {
                search_limit: 50,
                window_days: 7,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_session_secret() {
        let mut config = valid_config();
        config.auth.session_secret = "short-secret".to_string();

        let error = config
            .validate()
            .expect_err("session secret shorter than 32 bytes must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("auth.session_secret")
        ));
    }

    #[test]
    fn validate_rejects_inverted_retry_delays() {
        let mut config = valid_config();
        config.retry.initial_delay_ms = 60_000;
        config.retry.max_delay_ms = 1_000;

        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_app_credentials() {
        let mut config = valid_config();
        config.instagram.app_secret = "  ".to_string();

        assert!(config.validate().is_err());
    }
}
