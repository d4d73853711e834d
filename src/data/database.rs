//! SQLite database operations
//!
//! All database access goes through this module.
//! Every write is keyed by a uniqueness constraint so concurrent
//! writers converge instead of duplicating rows.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn to_json_list<T: serde::Serialize>(values: &[T]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn millis_to_datetime(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(DateTime::from_timestamp_millis)
}

fn account_from_row(row: &SqliteRow) -> Result<Account, sqlx::Error> {
    let owner_kind: String = row.try_get("owner_kind")?;
    let owner_id: String = row.try_get("owner_id")?;
    let owner = Owner::from_parts(&owner_kind, owner_id).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown owner kind: {}", owner_kind).into())
    })?;
    let token_kind: String = row.try_get("token_kind")?;
    let scopes: String = row.try_get("scopes")?;

    Ok(Account {
        id: row.try_get("id")?,
        owner,
        ig_user_id: row.try_get("ig_user_id")?,
        username: row.try_get("username")?,
        account_type: row.try_get("account_type")?,
        access_token: row.try_get("access_token")?,
        token_kind: TokenKind::parse(&token_kind),
        token_expires_at: row.try_get("token_expires_at")?,
        scopes: parse_json_list(&scopes),
        profile_picture_url: row.try_get("profile_picture_url")?,
        followers_count: row.try_get("followers_count")?,
        follows_count: row.try_get("follows_count")?,
        media_count: row.try_get("media_count")?,
        last_synced_at: row.try_get("last_synced_at")?,
        is_active: row.try_get("is_active")?,
        needs_reconnect: row.try_get("needs_reconnect")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, sqlx::Error> {
    let message_type: String = row.try_get("message_type")?;
    let attachments: String = row.try_get("attachments")?;

    Ok(Message {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        conversation_id: row.try_get("conversation_id")?,
        ig_message_id: row.try_get("ig_message_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_username: row.try_get("sender_username")?,
        recipient_id: row.try_get("recipient_id")?,
        recipient_username: row.try_get("recipient_username")?,
        body: row.try_get("body")?,
        message_type: MessageType::parse(&message_type),
        attachments: parse_json_list(&attachments),
        is_incoming: row.try_get("is_incoming")?,
        is_read: row.try_get("is_read")?,
        sent_at: millis_to_datetime(row.try_get("sent_at")?),
        created_at: row.try_get("created_at")?,
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post, sqlx::Error> {
    let hashtags: String = row.try_get("hashtags")?;
    let mentions: String = row.try_get("mentions")?;

    Ok(Post {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        ig_media_id: row.try_get("ig_media_id")?,
        media_type: row.try_get("media_type")?,
        media_url: row.try_get("media_url")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        permalink: row.try_get("permalink")?,
        caption: row.try_get("caption")?,
        like_count: row.try_get("like_count")?,
        comments_count: row.try_get("comments_count")?,
        hashtags: parse_json_list(&hashtags),
        mentions: parse_json_list(&mentions),
        impressions: row.try_get("impressions")?,
        reach: row.try_get("reach")?,
        saved: row.try_get("saved")?,
        posted_at: row.try_get("posted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>, AppError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    /// Get the account linked to an owner, active or not.
    pub async fn get_account_by_owner(&self, owner: &Owner) -> Result<Option<Account>, AppError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE owner_kind = ? AND owner_id = ?")
            .bind(owner.kind())
            .bind(owner.id())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    pub async fn get_account_by_ig_user_id(
        &self,
        ig_user_id: &str,
    ) -> Result<Option<Account>, AppError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE ig_user_id = ?")
            .bind(ig_user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    /// Profile picture of a locally linked account with this handle.
    pub async fn find_profile_picture_by_username(
        &self,
        username: &str,
    ) -> Result<Option<String>, AppError> {
        let url: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT profile_picture_url FROM accounts
            WHERE username = ? COLLATE NOCASE AND profile_picture_url IS NOT NULL
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(url.flatten())
    }

    pub async fn insert_account(&self, account: &Account) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, owner_kind, owner_id, ig_user_id, username, account_type,
                access_token, token_kind, token_expires_at, scopes, profile_picture_url,
                followers_count, follows_count, media_count, last_synced_at,
                is_active, needs_reconnect, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(account.owner.kind())
        .bind(account.owner.id())
        .bind(&account.ig_user_id)
        .bind(&account.username)
        .bind(&account.account_type)
        .bind(&account.access_token)
        .bind(account.token_kind.as_str())
        .bind(account.token_expires_at)
        .bind(to_json_list(&account.scopes))
        .bind(&account.profile_picture_url)
        .bind(account.followers_count)
        .bind(account.follows_count)
        .bind(account.media_count)
        .bind(account.last_synced_at)
        .bind(account.is_active)
        .bind(account.needs_reconnect)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite identity, credentials and profile fields of an account.
    ///
    /// # Returns
    /// `true` if updated, `false` if no matching account row exists.
    pub async fn update_account(&self, account: &Account) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                ig_user_id = ?, username = ?, account_type = ?, access_token = ?,
                token_kind = ?, token_expires_at = ?, scopes = ?, profile_picture_url = ?,
                followers_count = ?, follows_count = ?, media_count = ?,
                is_active = ?, needs_reconnect = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&account.ig_user_id)
        .bind(&account.username)
        .bind(&account.account_type)
        .bind(&account.access_token)
        .bind(account.token_kind.as_str())
        .bind(account.token_expires_at)
        .bind(to_json_list(&account.scopes))
        .bind(&account.profile_picture_url)
        .bind(account.followers_count)
        .bind(account.follows_count)
        .bind(account.media_count)
        .bind(account.is_active)
        .bind(account.needs_reconnect)
        .bind(Utc::now())
        .bind(&account.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Store a refreshed token and clear any reconnect flag.
    pub async fn update_account_token(
        &self,
        id: &str,
        access_token: &str,
        token_kind: TokenKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = ?, token_kind = ?, token_expires_at = ?,
                needs_reconnect = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(token_kind.as_str())
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_account_needs_reconnect(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE accounts SET needs_reconnect = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_account_synced(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE accounts SET last_synced_at = ?, updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Soft-disable an account: the row and its history stay, the token goes.
    pub async fn disconnect_account(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET is_active = 0, access_token = NULL, token_expires_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Return which of `ig_message_ids` are already stored for the account.
    ///
    /// Callers bound the slice size; SQLite limits bound parameters.
    pub async fn get_existing_message_ids(
        &self,
        account_id: &str,
        ig_message_ids: &[String],
    ) -> Result<HashSet<String>, AppError> {
        if ig_message_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = ig_message_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "SELECT ig_message_id FROM messages WHERE account_id = ? AND ig_message_id IN ({})",
            placeholders
        );

        let mut query_builder = sqlx::query_scalar::<_, String>(&query).bind(account_id);
        for id in ig_message_ids {
            query_builder = query_builder.bind(id);
        }

        let existing = query_builder.fetch_all(&self.pool).await?;
        Ok(existing.into_iter().collect())
    }

    /// Insert a message unless `(account_id, ig_message_id)` already exists.
    ///
    /// # Returns
    /// `true` if a row was inserted.
    pub async fn insert_message(&self, message: &Message) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                id, account_id, conversation_id, ig_message_id, sender_id, sender_username,
                recipient_id, recipient_username, body, message_type, attachments,
                is_incoming, is_read, sent_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, ig_message_id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.account_id)
        .bind(&message.conversation_id)
        .bind(&message.ig_message_id)
        .bind(&message.sender_id)
        .bind(&message.sender_username)
        .bind(&message.recipient_id)
        .bind(&message.recipient_username)
        .bind(&message.body)
        .bind(message.message_type.as_str())
        .bind(to_json_list(&message.attachments))
        .bind(message.is_incoming)
        .bind(message.is_read)
        .bind(message.sent_at.map(|t| t.timestamp_millis()))
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// All messages of an account, oldest first.
    pub async fn get_messages_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?
            ORDER BY sent_at IS NULL, sent_at ASC, created_at ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count_messages(&self, account_id: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Mark incoming messages sent at or before `as_of` as read.
    ///
    /// Messages arriving after `as_of` stay unread.
    pub async fn mark_conversation_read(
        &self,
        account_id: &str,
        conversation_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET is_read = 1
            WHERE account_id = ? AND conversation_id = ? AND is_incoming = 1
              AND is_read = 0 AND (sent_at IS NULL OR sent_at <= ?)
            "#,
        )
        .bind(account_id)
        .bind(conversation_id)
        .bind(as_of.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Conversation id of the latest stored message exchanged with a counterparty.
    pub async fn find_conversation_id_for_counterparty(
        &self,
        account_id: &str,
        counterparty_id: &str,
    ) -> Result<Option<String>, AppError> {
        let conversation_id = sqlx::query_scalar(
            r#"
            SELECT conversation_id FROM messages
            WHERE account_id = ? AND (sender_id = ? OR recipient_id = ?)
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(counterparty_id)
        .bind(counterparty_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation_id)
    }

    /// Move messages filed under the synthetic `ig:<counterparty>` id into
    /// the upstream conversation.
    pub async fn adopt_synthetic_conversation(
        &self,
        account_id: &str,
        counterparty_id: &str,
        conversation_id: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET conversation_id = ?
            WHERE account_id = ? AND conversation_id = 'ig:' || ?
            "#,
        )
        .bind(conversation_id)
        .bind(account_id)
        .bind(counterparty_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Insert a post or refresh its mutable fields.
    pub async fn upsert_post(&self, post: &Post) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO posts (
                id, account_id, ig_media_id, media_type, media_url, thumbnail_url, permalink,
                caption, like_count, comments_count, hashtags, mentions, impressions, reach,
                saved, posted_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, ig_media_id) DO UPDATE SET
                media_type = excluded.media_type,
                media_url = excluded.media_url,
                thumbnail_url = excluded.thumbnail_url,
                permalink = excluded.permalink,
                caption = excluded.caption,
                like_count = excluded.like_count,
                comments_count = excluded.comments_count,
                hashtags = excluded.hashtags,
                mentions = excluded.mentions,
                impressions = COALESCE(excluded.impressions, posts.impressions),
                reach = COALESCE(excluded.reach, posts.reach),
                saved = COALESCE(excluded.saved, posts.saved),
                posted_at = excluded.posted_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&post.id)
        .bind(&post.account_id)
        .bind(&post.ig_media_id)
        .bind(&post.media_type)
        .bind(&post.media_url)
        .bind(&post.thumbnail_url)
        .bind(&post.permalink)
        .bind(&post.caption)
        .bind(post.like_count)
        .bind(post.comments_count)
        .bind(to_json_list(&post.hashtags))
        .bind(to_json_list(&post.mentions))
        .bind(post.impressions)
        .bind(post.reach)
        .bind(post.saved)
        .bind(post.posted_at)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_posts(&self, account_id: &str) -> Result<Vec<Post>, AppError> {
        let rows = sqlx::query("SELECT * FROM posts WHERE account_id = ? ORDER BY posted_at DESC")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(post_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Search events (quota)
    // =========================================================================

    #[cfg(test)]
    pub async fn record_search_event(
        &self,
        owner_key: &str,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO search_events (id, owner_key, query, occurred_at) VALUES (?, ?, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(owner_key)
        .bind(query)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a search if the owner has fewer than `limit` since `since`.
    ///
    /// The count and the insert run as one statement, so concurrent callers
    /// cannot both take the last slot. Returns the event id on success.
    pub async fn reserve_search_event(
        &self,
        owner_key: &str,
        query: &str,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Option<String>, AppError> {
        let id = EntityId::new().0;
        let result = sqlx::query(
            r#"
            INSERT INTO search_events (id, owner_key, query, occurred_at)
            SELECT ?, ?, ?, ?
            WHERE (
                SELECT COUNT(*) FROM search_events
                WHERE owner_key = ? AND occurred_at >= ?
            ) < ?
            "#,
        )
        .bind(&id)
        .bind(owner_key)
        .bind(query)
        .bind(at.timestamp_millis())
        .bind(owner_key)
        .bind(since.timestamp_millis())
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(id))
    }

    /// Give back a reserved search slot.
    pub async fn release_search_event(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM search_events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Count and oldest timestamp of an owner's searches since `since`.
    pub async fn search_events_since(
        &self,
        owner_key: &str,
        since: DateTime<Utc>,
    ) -> Result<(i64, Option<DateTime<Utc>>), AppError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS used, MIN(occurred_at) AS oldest
            FROM search_events
            WHERE owner_key = ? AND occurred_at >= ?
            "#,
        )
        .bind(owner_key)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        let used: i64 = row.try_get("used")?;
        let oldest: Option<i64> = row.try_get("oldest")?;
        Ok((used, millis_to_datetime(oldest)))
    }
}
