//! Webhook message ingestion
//!
//! Upstream redelivers freely, so every write goes through the message
//! uniqueness key and a repeated delivery only counts duplicates.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::data::{Account, Database, EntityId, Message};
use crate::error::AppError;
use crate::instagram::webhook::{InboundMessage, WebhookPayload, convert_attachments, extract_messages};
use crate::metrics::WEBHOOK_DELIVERIES_TOTAL;

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
pub struct IngestReport {
    pub stored: usize,
    pub duplicates: usize,
    pub unknown_accounts: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct WebhookIngestor {
    db: Arc<Database>,
}

impl WebhookIngestor {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store the messages of one delivery. Failures are counted, not returned.
    pub async fn ingest(&self, payload: WebhookPayload) -> IngestReport {
        if payload.object != "instagram" {
            tracing::debug!(object = %payload.object, "Ignoring webhook for other object type");
        }

        let extracted = extract_messages(payload);
        let mut report = IngestReport {
            skipped: extracted.skipped_fields.len() + extracted.malformed,
            ..IngestReport::default()
        };
        for field in &extracted.skipped_fields {
            tracing::debug!(field = %field, "Unhandled webhook change field");
        }

        let mut accounts: HashMap<String, Option<Account>> = HashMap::new();
        for inbound in extracted.messages {
            if !accounts.contains_key(&inbound.account_ig_id) {
                let account = match self.db.get_account_by_ig_user_id(&inbound.account_ig_id).await {
                    Ok(account) => account.filter(|a| a.is_active),
                    Err(error) => {
                        tracing::warn!(ig_user_id = %inbound.account_ig_id, %error, "Account lookup failed");
                        report.errors += 1;
                        continue;
                    }
                };
                accounts.insert(inbound.account_ig_id.clone(), account);
            }
            let Some(Some(account)) = accounts.get(&inbound.account_ig_id) else {
                tracing::debug!(ig_user_id = %inbound.account_ig_id, "Webhook for unknown account");
                report.unknown_accounts += 1;
                continue;
            };

            match self.store(account, inbound).await {
                Ok(true) => report.stored += 1,
                Ok(false) => report.duplicates += 1,
                Err(error) => {
                    tracing::warn!(account_id = %account.id, %error, "Failed to store webhook message");
                    report.errors += 1;
                }
            }
        }

        let result = if report.errors > 0 { "partial" } else { "processed" };
        WEBHOOK_DELIVERIES_TOTAL.with_label_values(&[result]).inc();
        tracing::info!(
            stored = report.stored,
            duplicates = report.duplicates,
            unknown_accounts = report.unknown_accounts,
            errors = report.errors,
            "Webhook delivery processed"
        );
        report
    }

    async fn store(&self, account: &Account, inbound: InboundMessage) -> Result<bool, AppError> {
        let event = inbound.event;
        let sent_at = event.sent_at();
        let Some(body) = event.message else {
            return Ok(false);
        };

        let is_incoming = !body.is_echo && event.sender.id != account.ig_user_id;
        let counterparty = if is_incoming {
            &event.sender.id
        } else {
            &event.recipient.id
        };
        let conversation_id = match self
            .db
            .find_conversation_id_for_counterparty(&account.id, counterparty)
            .await?
        {
            Some(existing) => existing,
            None => format!("ig:{}", counterparty),
        };
        let (message_type, attachments) = convert_attachments(&body.attachments);

        let message = Message {
            id: EntityId::new().0,
            account_id: account.id.clone(),
            conversation_id,
            ig_message_id: body.mid,
            sender_id: event.sender.id.clone(),
            sender_username: None,
            recipient_id: event.recipient.id.clone(),
            recipient_username: None,
            body: body.text.filter(|t| !t.is_empty()),
            message_type,
            attachments,
            is_incoming,
            is_read: !is_incoming,
            sent_at: sent_at.or_else(|| Some(Utc::now())),
            created_at: Utc::now(),
        };
        self.db.insert_message(&message).await
    }
}
