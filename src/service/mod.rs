//! Service layer
//!
//! Business logic separated from HTTP handlers. Services orchestrate the
//! database, caches and the Graph API client.

mod conversations;
mod dedupe;
mod ingest;
mod profile_picture;
mod progress;
mod quota;
mod sync;

#[cfg(test)]
pub(crate) mod fixtures;

pub use conversations::{ConversationProjector, project};
pub use dedupe::{MessageDeduplicator, filter_new};
pub use ingest::{IngestReport, WebhookIngestor};
pub use profile_picture::{ProfilePictureResolver, normalize_username};
pub use progress::{ProgressEvent, ProgressHub, ProgressSink, ProgressStage, SyncKind};
pub use quota::{QuotaService, QuotaUsage};
pub use sync::{ActiveSyncs, SyncEngine, SyncPermit, SyncPlan, SyncReport, SyncSettings};
