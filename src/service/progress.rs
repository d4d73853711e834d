//! Sync progress fan-out
//!
//! Sync tasks emit events into an unbounded channel and never wait on
//! delivery. One forwarder task moves them onto a per-owner broadcast
//! channel that `GET /sync/events` subscribers read from.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::tasks::BackgroundTasks;

/// Buffered events per owner; slow subscribers skip ahead.
const OWNER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Conversations,
    History,
    Media,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Conversations => "conversations",
            SyncKind::History => "history",
            SyncKind::Media => "media",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    /// A page was fetched and processed
    Page,
    /// Periodic update within a page
    Items,
    /// The run finished, successfully or not
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub account_id: String,
    pub kind: SyncKind,
    pub stage: ProgressStage,
    pub page: u32,
    /// Items fetched from upstream so far
    pub fetched: usize,
    pub synced: usize,
    pub errors: usize,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct Envelope {
    owner_key: String,
    event: ProgressEvent,
}

/// Handle a sync run reports through. Emitting never blocks.
#[derive(Clone)]
pub struct ProgressSink {
    owner_key: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ProgressSink {
    pub fn emit(&self, event: ProgressEvent) {
        if self
            .tx
            .send(Envelope {
                owner_key: self.owner_key.clone(),
                event,
            })
            .is_err()
        {
            tracing::debug!(owner = %self.owner_key, "Progress channel closed, dropping event");
        }
    }

    /// Sink whose events are collected by the returned receiver.
    pub fn collecting(owner_key: &str) -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                owner_key: owner_key.to_string(),
                tx,
            },
            ProgressReceiver { rx },
        )
    }
}

/// Direct consumer of a [`ProgressSink`], for callers that bypass the hub.
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ProgressReceiver {
    /// Events emitted so far.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>>;

/// Per-owner progress channels
pub struct ProgressHub {
    tx: mpsc::UnboundedSender<Envelope>,
    channels: Channels,
}

impl ProgressHub {
    /// Create the hub and start its forwarder on `tasks`.
    pub fn start(tasks: &BackgroundTasks) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let channels: Channels = Arc::new(Mutex::new(HashMap::new()));

        tasks.spawn(
            "progress_forwarder",
            forward(rx, channels.clone(), tasks.shutdown_token()),
        );

        Self { tx, channels }
    }

    pub fn sink(&self, owner_key: &str) -> ProgressSink {
        ProgressSink {
            owner_key: owner_key.to_string(),
            tx: self.tx.clone(),
        }
    }

    pub fn subscribe(&self, owner_key: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Owners whose streams have all closed
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(owner_key.to_string())
            .or_insert_with(|| broadcast::channel(OWNER_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    channels: Channels,
    shutdown: CancellationToken,
) -> Result<(), std::convert::Infallible> {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let mut channels = match channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = channels.get(&envelope.owner_key) else {
            continue;
        };
        if sender.send(envelope.event).is_err() {
            // Last subscriber went away
            channels.remove(&envelope.owner_key);
        }
    }

    tracing::debug!("Progress forwarder stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(page: u32, done: bool) -> ProgressEvent {
        ProgressEvent {
            account_id: "acct".to_string(),
            kind: SyncKind::Conversations,
            stage: if done { ProgressStage::Done } else { ProgressStage::Page },
            page,
            fetched: 0,
            synced: 0,
            errors: 0,
            done,
            error: None,
        }
    }

    #[tokio::test]
    async fn events_reach_only_the_owning_subscriber() {
        let tasks = BackgroundTasks::new();
        let hub = ProgressHub::start(&tasks);
        let mut mine = hub.subscribe("user:1");
        let mut theirs = hub.subscribe("user:2");

        hub.sink("user:1").emit(event(1, false));
        hub.sink("user:1").emit(event(1, true));

        let first = tokio::time::timeout(Duration::from_secs(1), mine.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.page, 1);
        let second = tokio::time::timeout(Duration::from_secs(1), mine.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(second.done);
        assert!(theirs.try_recv().is_err());

        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn emitting_without_listeners_does_not_block() {
        let (sink, mut receiver) = ProgressSink::collecting("user:1");
        sink.emit(event(1, false));
        sink.emit(event(2, false));
        assert_eq!(receiver.drain().len(), 2);

        drop(receiver);
        sink.emit(event(3, true));
    }

    #[tokio::test]
    async fn closed_streams_release_their_channel() {
        let tasks = BackgroundTasks::new();
        let hub = ProgressHub::start(&tasks);
        let gone = hub.subscribe("user:1");
        let _other = hub.subscribe("user:2");
        drop(gone);

        let _again = hub.subscribe("user:3");

        let channels = hub.channels.lock().unwrap();
        assert!(!channels.contains_key("user:1"));
        assert!(channels.contains_key("user:2"));
        assert!(channels.contains_key("user:3"));
    }
}
