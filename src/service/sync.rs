//! Paginated sync engine
//!
//! Walks cursor-paginated conversations and media, deduplicates against
//! stored rows and persists what is new. Per-item failures are counted in
//! the report; only a failure to start (token, first page) is an error.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::dedupe::MessageDeduplicator;
use super::progress::{ProgressEvent, ProgressSink, ProgressStage, SyncKind};
use crate::config::SyncConfig;
use crate::data::{Account, Attachment, Database, EntityId, Message, MessageType, Post};
use crate::error::AppError;
use crate::instagram::graph::{
    AttachmentRecord, ConversationRecord, MediaRecord, MessageRecord, Page, parse_graph_time,
};
use crate::instagram::{GraphApi, Sleeper, TokenLifecycleManager};
use crate::metrics::{ACTIVE_SYNCS, SYNC_ITEMS_TOTAL, SYNC_RUNS_TOTAL};

// =============================================================================
// Active-sync guard
// =============================================================================

/// Accounts with a sync in progress, process-local.
#[derive(Clone, Default)]
pub struct ActiveSyncs {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveSyncs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the account, or `None` if a sync is already running.
    pub fn try_acquire(&self, account_id: &str) -> Option<SyncPermit> {
        let mut active = lock(&self.inner);
        if !active.insert(account_id.to_string()) {
            return None;
        }
        ACTIVE_SYNCS.inc();
        Some(SyncPermit {
            account_id: account_id.to_string(),
            inner: self.inner.clone(),
        })
    }

    pub fn is_active(&self, account_id: &str) -> bool {
        lock(&self.inner).contains(account_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Releases the account when dropped, including on panic.
pub struct SyncPermit {
    account_id: String,
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SyncPermit {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        lock(&self.inner).remove(&self.account_id);
        ACTIVE_SYNCS.dec();
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Outcome of one sync run
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SyncReport {
    /// Rows newly persisted (messages) or upserted (posts)
    pub synced: usize,
    pub errors: usize,
    pub pages: u32,
    /// Items returned by upstream across all pages
    pub fetched: usize,
    pub reached_cutoff: bool,
    pub hit_page_cap: bool,
}

impl SyncReport {
    fn record_error(&mut self, kind: SyncKind) {
        self.errors += 1;
        SYNC_ITEMS_TOTAL.with_label_values(&[kind.as_str(), "error"]).inc();
    }

    fn record_errors(&mut self, kind: SyncKind, count: usize) {
        for _ in 0..count {
            self.record_error(kind);
        }
    }

    fn record_synced(&mut self, kind: SyncKind) {
        self.synced += 1;
        SYNC_ITEMS_TOTAL.with_label_values(&[kind.as_str(), "synced"]).inc();
    }
}

/// What a background run should do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncPlan {
    /// Latest conversations, then media
    Full,
    /// Conversations back to the cutoff
    History { cutoff: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: u32,
    pub max_pages: u32,
    pub throttle_after_pages: u32,
    pub page_delay: Duration,
    pub progress_every: usize,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_pages: config.max_pages,
            throttle_after_pages: config.throttle_after_pages,
            page_delay: Duration::from_millis(config.page_delay_ms),
            progress_every: config.progress_every.max(1),
        }
    }
}

/// Progress bookkeeping for one run
struct Tracker<'a> {
    sink: &'a ProgressSink,
    account_id: String,
    kind: SyncKind,
    every: usize,
    processed: usize,
}

impl Tracker<'_> {
    fn event(&self, stage: ProgressStage, report: &SyncReport, error: Option<String>) -> ProgressEvent {
        ProgressEvent {
            account_id: self.account_id.clone(),
            kind: self.kind,
            stage,
            page: report.pages,
            fetched: report.fetched,
            synced: report.synced,
            errors: report.errors,
            done: stage == ProgressStage::Done,
            error,
        }
    }

    fn item_processed(&mut self, report: &SyncReport) {
        self.processed += 1;
        if self.processed % self.every == 0 {
            self.sink.emit(self.event(ProgressStage::Items, report, None));
        }
    }

    fn page(&self, report: &SyncReport) {
        self.sink.emit(self.event(ProgressStage::Page, report, None));
    }

    fn finish(&self, result: &Result<SyncReport, AppError>) {
        let (report, error, status) = match result {
            Ok(report) => (report.clone(), None, "success"),
            Err(error) => (SyncReport::default(), Some(error.kind().to_string()), "error"),
        };
        SYNC_RUNS_TOTAL
            .with_label_values(&[self.kind.as_str(), status])
            .inc();
        self.sink.emit(self.event(ProgressStage::Done, &report, error));
    }
}

pub struct SyncEngine {
    db: Arc<Database>,
    graph: Arc<GraphApi>,
    tokens: Arc<TokenLifecycleManager>,
    dedupe: MessageDeduplicator,
    sleeper: Arc<dyn Sleeper>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        graph: Arc<GraphApi>,
        tokens: Arc<TokenLifecycleManager>,
        sleeper: Arc<dyn Sleeper>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            dedupe: MessageDeduplicator::new(db.clone()),
            db,
            graph,
            tokens,
            sleeper,
            settings,
        }
    }

    /// Run `plan` for an account. Used as the body of background tasks.
    pub async fn run(
        &self,
        account_id: &str,
        plan: SyncPlan,
        sink: ProgressSink,
        _permit: SyncPermit,
    ) -> Result<(), AppError> {
        let mut account = self
            .db
            .get_account(account_id)
            .await?
            .ok_or(AppError::NotFound)?;

        match plan {
            SyncPlan::Full => {
                let conversations = self.sync_conversations(&mut account, &sink).await?;
                let media = self.sync_media(&mut account, &sink).await?;
                tracing::info!(
                    account_id,
                    messages = conversations.synced,
                    posts = media.synced,
                    errors = conversations.errors + media.errors,
                    "Sync finished"
                );
            }
            SyncPlan::History { cutoff } => {
                let report = self.sync_history(&mut account, cutoff, &sink).await?;
                tracing::info!(
                    account_id,
                    messages = report.synced,
                    errors = report.errors,
                    pages = report.pages,
                    reached_cutoff = report.reached_cutoff,
                    "History sync finished"
                );
            }
        }
        Ok(())
    }

    /// Fetch recent conversations and persist new messages.
    pub async fn sync_conversations(
        &self,
        account: &mut Account,
        sink: &ProgressSink,
    ) -> Result<SyncReport, AppError> {
        let mut tracker = self.tracker(account, SyncKind::Conversations, sink);
        let result = self.walk_conversations(account, None, &mut tracker).await;
        self.finish(account, &tracker, &result).await;
        result
    }

    /// Walk conversations newest first until `cutoff` or the page cap.
    pub async fn sync_history(
        &self,
        account: &mut Account,
        cutoff: DateTime<Utc>,
        sink: &ProgressSink,
    ) -> Result<SyncReport, AppError> {
        let mut tracker = self.tracker(account, SyncKind::History, sink);
        let result = self.walk_conversations(account, Some(cutoff), &mut tracker).await;
        self.finish(account, &tracker, &result).await;
        result
    }

    /// Fetch owned media and upsert posts with best-effort insights.
    pub async fn sync_media(
        &self,
        account: &mut Account,
        sink: &ProgressSink,
    ) -> Result<SyncReport, AppError> {
        let mut tracker = self.tracker(account, SyncKind::Media, sink);
        let result = self.walk_media(account, &mut tracker).await;
        self.finish(account, &tracker, &result).await;
        result
    }

    fn tracker<'a>(&self, account: &Account, kind: SyncKind, sink: &'a ProgressSink) -> Tracker<'a> {
        Tracker {
            sink,
            account_id: account.id.clone(),
            kind,
            every: self.settings.progress_every,
            processed: 0,
        }
    }

    async fn finish(
        &self,
        account: &mut Account,
        tracker: &Tracker<'_>,
        result: &Result<SyncReport, AppError>,
    ) {
        match result {
            Ok(report) => {
                if let Err(error) = self.db.mark_account_synced(&account.id, Utc::now()).await {
                    tracing::warn!(account_id = %account.id, %error, "Failed to record sync time");
                }
                tracing::debug!(account_id = %account.id, kind = tracker.kind.as_str(), ?report, "Sync run complete");
            }
            Err(error) => {
                self.tokens.handle_rejection(account, error).await;
                tracing::warn!(account_id = %account.id, kind = tracker.kind.as_str(), %error, "Sync run failed");
            }
        }
        tracker.finish(result);
    }

    /// Move to the next page, or `None` when the walk should stop.
    async fn advance<T: serde::de::DeserializeOwned>(
        &self,
        next: Option<String>,
        report: &mut SyncReport,
        tracker: &Tracker<'_>,
    ) -> Result<Option<Page<T>>, AppError> {
        let Some(next) = next else {
            return Ok(None);
        };
        if report.pages >= self.settings.max_pages {
            report.hit_page_cap = true;
            tracing::warn!(
                account_id = %tracker.account_id,
                pages = report.pages,
                "Page cap reached, stopping sync"
            );
            return Ok(None);
        }
        if report.pages >= self.settings.throttle_after_pages {
            self.sleeper.sleep(self.settings.page_delay).await;
        }

        match self.graph.next_page::<T>(&next).await {
            Ok(page) => Ok(Some(page)),
            Err(AppError::ReconnectRequired) => Err(AppError::ReconnectRequired),
            Err(error) => {
                tracing::warn!(
                    account_id = %tracker.account_id,
                    page = report.pages + 1,
                    %error,
                    "Failed to fetch next page, stopping"
                );
                report.record_error(tracker.kind);
                Ok(None)
            }
        }
    }

    async fn walk_conversations(
        &self,
        account: &mut Account,
        cutoff: Option<DateTime<Utc>>,
        tracker: &mut Tracker<'_>,
    ) -> Result<SyncReport, AppError> {
        let token = self.tokens.ensure_valid_token(account).await?;
        let account = &*account;
        let mut page = self
            .graph
            .conversations_page(&token, self.settings.page_size)
            .await?;
        let mut report = SyncReport::default();

        loop {
            report.pages += 1;
            report.fetched += page.data.len() + page.malformed;
            report.record_errors(tracker.kind, page.malformed);
            let next = page.next_url().map(str::to_string);
            let mut crossed = false;

            for mut conversation in page.data {
                let updated_at = conversation
                    .updated_time
                    .as_deref()
                    .and_then(parse_graph_time);
                if let (Some(cutoff), Some(updated_at)) = (cutoff, updated_at) {
                    if updated_at < cutoff {
                        crossed = true;
                        continue;
                    }
                }
                let (messages, malformed) =
                    self.conversation_messages(&mut conversation, cutoff).await;
                report.record_errors(tracker.kind, malformed);
                self.adopt_counterparties(account, &conversation, &messages)
                    .await;
                self.persist_messages(account, &conversation.id, messages, &mut report, tracker)
                    .await;
            }
            tracker.page(&report);

            if crossed {
                report.reached_cutoff = true;
                break;
            }
            match self.advance(next, &mut report, tracker).await? {
                Some(next_page) => page = next_page,
                None => break,
            }
        }
        Ok(report)
    }

    async fn walk_media(
        &self,
        account: &mut Account,
        tracker: &mut Tracker<'_>,
    ) -> Result<SyncReport, AppError> {
        let token = self.tokens.ensure_valid_token(account).await?;
        let account = &*account;
        let mut page = self.graph.media_page(&token, self.settings.page_size).await?;
        let mut report = SyncReport::default();

        loop {
            report.pages += 1;
            report.fetched += page.data.len() + page.malformed;
            report.record_errors(tracker.kind, page.malformed);
            let next = page.next_url().map(str::to_string);

            for record in page.data {
                self.persist_media(account, &token, record, &mut report, tracker)
                    .await;
            }
            tracker.page(&report);

            match self.advance(next, &mut report, tracker).await? {
                Some(next_page) => page = next_page,
                None => break,
            }
        }
        Ok(report)
    }

    /// Messages of one conversation, following nested pages in history mode.
    ///
    /// Also returns how many message records could not be decoded.
    async fn conversation_messages(
        &self,
        conversation: &mut ConversationRecord,
        cutoff: Option<DateTime<Utc>>,
    ) -> (Vec<MessageRecord>, usize) {
        let Some(first) = conversation.messages.take() else {
            return (Vec::new(), 0);
        };
        let mut messages = Vec::new();
        let mut malformed = first.malformed;
        let mut next = first.next_url().map(str::to_string);
        let mut crossed = append_until_cutoff(&mut messages, first.data, cutoff);

        let Some(cutoff) = cutoff else {
            return (messages, malformed);
        };
        let mut pages = 1;
        while let Some(url) = next.take() {
            if crossed || pages >= self.settings.max_pages {
                break;
            }
            match self.graph.next_page::<MessageRecord>(&url).await {
                Ok(page) => {
                    pages += 1;
                    malformed += page.malformed;
                    next = page.next_url().map(str::to_string);
                    crossed = append_until_cutoff(&mut messages, page.data, Some(cutoff));
                }
                Err(error) => {
                    tracing::warn!(conversation_id = %conversation.id, %error, "Failed to fetch older messages");
                    break;
                }
            }
        }
        (messages, malformed)
    }

    /// Fold webhook-only threads (`ig:<counterparty>`) into the upstream conversation.
    async fn adopt_counterparties(
        &self,
        account: &Account,
        conversation: &ConversationRecord,
        messages: &[MessageRecord],
    ) {
        let counterparties: HashSet<&str> = conversation
            .participants
            .data
            .iter()
            .chain(messages.iter().filter_map(|m| m.from.as_ref()))
            .chain(messages.iter().flat_map(|m| m.to.data.iter()))
            .map(|p| p.id.as_str())
            .filter(|id| *id != account.ig_user_id)
            .collect();

        for counterparty in counterparties {
            match self
                .db
                .adopt_synthetic_conversation(&account.id, counterparty, &conversation.id)
                .await
            {
                Ok(0) => {}
                Ok(moved) => tracing::debug!(
                    account_id = %account.id,
                    conversation_id = %conversation.id,
                    moved,
                    "Adopted webhook messages into conversation"
                ),
                Err(error) => tracing::warn!(
                    account_id = %account.id,
                    conversation_id = %conversation.id,
                    %error,
                    "Failed to adopt webhook messages"
                ),
            }
        }
    }

    async fn persist_messages(
        &self,
        account: &Account,
        conversation_id: &str,
        records: Vec<MessageRecord>,
        report: &mut SyncReport,
        tracker: &mut Tracker<'_>,
    ) {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let fresh: HashSet<String> = match self.dedupe.new_ids(&account.id, &ids).await {
            Ok(fresh) => fresh.into_iter().collect(),
            Err(error) => {
                // Fall back to the unique index
                tracing::warn!(account_id = %account.id, %error, "Dedup lookup failed");
                ids.into_iter().collect()
            }
        };

        for record in records {
            if !fresh.contains(&record.id) {
                tracker.item_processed(report);
                continue;
            }
            match to_message(account, conversation_id, &record) {
                Some(message) => match self.db.insert_message(&message).await {
                    Ok(true) => report.record_synced(tracker.kind),
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(
                            account_id = %account.id,
                            ig_message_id = %record.id,
                            %error,
                            "Failed to store message"
                        );
                        report.record_error(tracker.kind);
                    }
                },
                None => {
                    tracing::debug!(ig_message_id = %record.id, "Message has no sender, skipping");
                    report.record_error(tracker.kind);
                }
            }
            tracker.item_processed(report);
        }
    }

    async fn persist_media(
        &self,
        account: &Account,
        token: &str,
        record: MediaRecord,
        report: &mut SyncReport,
        tracker: &mut Tracker<'_>,
    ) {
        let mut post = to_post(account, record);

        match self.graph.media_insights(token, &post.ig_media_id).await {
            Ok(insights) => {
                post.impressions = insights.impressions;
                post.reach = insights.reach;
                post.saved = insights.saved;
            }
            Err(error) => {
                tracing::debug!(ig_media_id = %post.ig_media_id, %error, "Insights unavailable");
                report.record_error(tracker.kind);
            }
        }

        match self.db.upsert_post(&post).await {
            Ok(()) => report.record_synced(tracker.kind),
            Err(error) => {
                tracing::warn!(ig_media_id = %post.ig_media_id, %error, "Failed to store post");
                report.record_error(tracker.kind);
            }
        }
        tracker.item_processed(report);
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn append_until_cutoff(
    into: &mut Vec<MessageRecord>,
    page: Vec<MessageRecord>,
    cutoff: Option<DateTime<Utc>>,
) -> bool {
    let Some(cutoff) = cutoff else {
        into.extend(page);
        return false;
    };
    let mut crossed = false;
    for record in page {
        match record.created_time.as_deref().and_then(parse_graph_time) {
            Some(sent_at) if sent_at < cutoff => crossed = true,
            _ => into.push(record),
        }
    }
    crossed
}

fn to_message(account: &Account, conversation_id: &str, record: &MessageRecord) -> Option<Message> {
    let from = record.from.as_ref()?;
    let is_incoming = from.id != account.ig_user_id;
    let recipient = record.to.data.first();
    let (message_type, attachments) = convert_attachments(&record.attachments.data);

    Some(Message {
        id: EntityId::new().0,
        account_id: account.id.clone(),
        conversation_id: conversation_id.to_string(),
        ig_message_id: record.id.clone(),
        sender_id: from.id.clone(),
        sender_username: from.username.clone(),
        recipient_id: recipient
            .map(|r| r.id.clone())
            .unwrap_or_else(|| account.ig_user_id.clone()),
        recipient_username: recipient.and_then(|r| r.username.clone()),
        body: record.message.clone().filter(|m| !m.is_empty()),
        message_type,
        attachments,
        is_incoming,
        is_read: !is_incoming,
        sent_at: record.created_time.as_deref().and_then(parse_graph_time),
        created_at: Utc::now(),
    })
}

fn convert_attachments(records: &[AttachmentRecord]) -> (MessageType, Vec<Attachment>) {
    let attachments: Vec<(MessageType, Attachment)> = records
        .iter()
        .filter_map(|record| {
            let (message_type, kind, url) = if let Some(image) = &record.image_data {
                (MessageType::Image, "image", image.url.clone())
            } else if let Some(video) = &record.video_data {
                (MessageType::Video, "video", video.url.clone())
            } else if let Some(audio) = &record.audio_data {
                (MessageType::Audio, "audio", audio.url.clone())
            } else if let Some(file_url) = &record.file_url {
                (MessageType::File, "file", Some(file_url.clone()))
            } else if let Some(share) = &record.share {
                (MessageType::Share, "share", share.url.clone())
            } else {
                return None;
            };
            Some((
                message_type,
                Attachment {
                    kind: kind.to_string(),
                    url,
                },
            ))
        })
        .collect();

    let message_type = attachments
        .first()
        .map(|(t, _)| *t)
        .unwrap_or(MessageType::Text);
    (message_type, attachments.into_iter().map(|(_, a)| a).collect())
}

fn to_post(account: &Account, record: MediaRecord) -> Post {
    let now = Utc::now();
    let caption = record.caption.unwrap_or_default();
    Post {
        id: EntityId::new().0,
        account_id: account.id.clone(),
        ig_media_id: record.id,
        media_type: record.media_type.unwrap_or_else(|| "IMAGE".to_string()),
        media_url: record.media_url,
        thumbnail_url: record.thumbnail_url,
        permalink: record.permalink,
        hashtags: extract_tokens(&caption, '#'),
        mentions: extract_tokens(&caption, '@'),
        caption: (!caption.is_empty()).then_some(caption),
        like_count: record.like_count,
        comments_count: record.comments_count,
        impressions: None,
        reach: None,
        saved: None,
        posted_at: record.timestamp.as_deref().and_then(parse_graph_time),
        created_at: now,
        updated_at: now,
    }
}

/// Lowercased, deduplicated `#tag` or `@handle` tokens in caption order.
pub fn extract_tokens(caption: &str, marker: char) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    let mut chars = caption.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        if c != marker {
            continue;
        }
        let preceded_by_word = caption[..index]
            .chars()
            .next_back()
            .is_some_and(|p| p.is_alphanumeric() || p == '_');
        let mut token = String::new();
        while let Some(&(_, next)) = chars.peek() {
            let allowed = next.is_alphanumeric() || next == '_' || (marker == '@' && next == '.');
            if !allowed {
                break;
            }
            token.push(next);
            chars.next();
        }
        let token = token.trim_end_matches('.').to_lowercase();
        if !preceded_by_word && !token.is_empty() && seen.insert(token.clone()) {
            tokens.push(token);
        }
    }
    tokens
}
