//! Conversation read model
//!
//! Summaries are recomputed from stored messages on every read, so they
//! are exactly as fresh as the last sync or webhook.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::data::{ConversationSummary, Counterparty, Database, Message};
use crate::error::AppError;

pub struct ConversationProjector {
    db: Arc<Database>,
}

impl ConversationProjector {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn list_conversations(
        &self,
        account_id: &str,
    ) -> Result<Vec<ConversationSummary>, AppError> {
        let messages = self.db.get_messages_for_account(account_id).await?;
        Ok(project(&messages))
    }

    /// Mark incoming messages up to now as read.
    pub async fn mark_read(&self, account_id: &str, conversation_id: &str) -> Result<u64, AppError> {
        self.mark_read_as_of(account_id, conversation_id, Utc::now())
            .await
    }

    pub async fn mark_read_as_of(
        &self,
        account_id: &str,
        conversation_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let updated = self
            .db
            .mark_conversation_read(account_id, conversation_id, as_of)
            .await?;
        tracing::debug!(account_id, conversation_id, updated, "Conversation marked read");
        Ok(updated)
    }
}

#[derive(Default)]
struct Accumulator<'a> {
    message_count: usize,
    incoming_count: usize,
    unread_count: usize,
    last: Option<&'a Message>,
    last_incoming: Option<&'a Message>,
}

/// `true` if `candidate` is more recent than `current`.
///
/// Undated messages never replace dated ones; among equals the later
/// position in the input wins.
fn is_newer(candidate: &Message, current: Option<&Message>) -> bool {
    match current {
        None => true,
        Some(current) => match (candidate.sent_at, current.sent_at) {
            (Some(a), Some(b)) => a >= b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => true,
        },
    }
}

/// Group messages by conversation and summarize each group.
///
/// Sorted by last message time, newest first; undated conversations last.
pub fn project(messages: &[Message]) -> Vec<ConversationSummary> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Accumulator<'_>> = HashMap::new();

    for message in messages {
        let group = groups
            .entry(message.conversation_id.as_str())
            .or_insert_with(|| {
                order.push(message.conversation_id.as_str());
                Accumulator::default()
            });

        group.message_count += 1;
        if message.is_incoming {
            group.incoming_count += 1;
            if !message.is_read {
                group.unread_count += 1;
            }
            if is_newer(message, group.last_incoming) {
                group.last_incoming = Some(message);
            }
        }
        if is_newer(message, group.last) {
            group.last = Some(message);
        }
    }

    let mut summaries: Vec<ConversationSummary> = order
        .into_iter()
        .filter_map(|id| groups.remove(id).map(|group| summarize(id, group)))
        .collect();

    summaries.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    summaries
}

fn summarize(conversation_id: &str, group: Accumulator<'_>) -> ConversationSummary {
    // Prefer the latest incoming sender; the last message may be our reply.
    let counterparty = match (group.last_incoming, group.last) {
        (Some(incoming), _) => Some(Counterparty {
            ig_user_id: incoming.sender_id.clone(),
            username: incoming.sender_username.clone(),
        }),
        (None, Some(outgoing)) => Some(Counterparty {
            ig_user_id: outgoing.recipient_id.clone(),
            username: outgoing.recipient_username.clone(),
        }),
        (None, None) => None,
    };

    ConversationSummary {
        conversation_id: conversation_id.to_string(),
        counterparty,
        message_count: group.message_count,
        incoming_count: group.incoming_count,
        unread_count: group.unread_count,
        last_message_text: group.last.and_then(|m| m.body.clone()),
        last_message_at: group.last.and_then(|m| m.sent_at),
        last_incoming_at: group.last_incoming.and_then(|m| m.sent_at),
    }
}
