//! Webhook payloads
//!
//! Deliveries look like `{object, entry: [{id, time, changes?, messaging?}]}`
//! where `entry.id` is the receiving professional account. Message events
//! arrive either under `messaging[]` or as a `changes[]` item with
//! `field == "messages"`; both carry the same event shape.
//!
//! Entries and events are kept as raw JSON until extraction and decoded one
//! at a time, so one bad event never drops its siblings.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::data::{Attachment, MessageType};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(deserialize_with = "crate::instagram::graph::string_or_number")]
    pub id: String,
    pub time: Option<i64>,
    #[serde(default)]
    pub changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub messaging: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChange {
    pub field: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventParty {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventAttachmentPayload {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Option<EventAttachmentPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub mid: String,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<EventAttachment>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: EventParty,
    pub recipient: EventParty,
    /// Unix milliseconds
    pub timestamp: Option<i64>,
    pub message: Option<EventMessage>,
}

impl MessagingEvent {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(DateTime::from_timestamp_millis)
    }
}

/// A message event tied to the account that received it
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub account_ig_id: String,
    pub event: MessagingEvent,
}

/// What a delivery contained besides message events
#[derive(Debug, Default)]
pub struct Extracted {
    pub messages: Vec<InboundMessage>,
    /// Change fields that are not handled, e.g. `comments`
    pub skipped_fields: Vec<String>,
    /// Events that could not be decoded or carried no message
    pub malformed: usize,
}

/// Flatten a delivery into message events.
pub fn extract_messages(payload: WebhookPayload) -> Extracted {
    let mut extracted = Extracted::default();

    for raw_entry in payload.entry {
        let entry = match serde_json::from_value::<WebhookEntry>(raw_entry) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(%error, "Undecodable webhook entry");
                extracted.malformed += 1;
                continue;
            }
        };

        for raw_event in entry.messaging {
            extracted.push_event(&entry.id, raw_event);
        }

        for raw_change in entry.changes {
            let change = match serde_json::from_value::<WebhookChange>(raw_change) {
                Ok(change) => change,
                Err(error) => {
                    tracing::warn!(%error, account_ig_id = %entry.id, "Undecodable webhook change");
                    extracted.malformed += 1;
                    continue;
                }
            };
            if change.field != "messages" {
                extracted.skipped_fields.push(change.field);
                continue;
            }
            extracted.push_event(&entry.id, change.value);
        }
    }

    extracted
}

impl Extracted {
    fn push_event(&mut self, account_ig_id: &str, raw: serde_json::Value) {
        match serde_json::from_value::<MessagingEvent>(raw) {
            Ok(event) if event.message.as_ref().is_some_and(|m| !m.is_deleted) => {
                self.messages.push(InboundMessage {
                    account_ig_id: account_ig_id.to_string(),
                    event,
                });
            }
            // Read receipts, reactions and deletions carry no new message.
            Ok(_) => self.malformed += 1,
            Err(error) => {
                tracing::warn!(%error, account_ig_id, "Undecodable webhook message event");
                self.malformed += 1;
            }
        }
    }
}

/// Map webhook attachments onto stored attachments and a message type.
pub fn convert_attachments(attachments: &[EventAttachment]) -> (MessageType, Vec<Attachment>) {
    let converted: Vec<Attachment> = attachments
        .iter()
        .map(|a| Attachment {
            kind: a.kind.clone(),
            url: a.payload.as_ref().and_then(|p| p.url.clone()),
        })
        .collect();

    let message_type = converted
        .first()
        .map(|a| match a.kind.as_str() {
            "image" => MessageType::Image,
            "video" => MessageType::Video,
            "audio" => MessageType::Audio,
            "file" => MessageType::File,
            "share" | "story_mention" | "ig_reel" | "reel" => MessageType::Share,
            _ => MessageType::File,
        })
        .unwrap_or(MessageType::Text);

    (message_type, converted)
}
