//! Message deduplication
//!
//! Known ids are loaded in bounded chunks and the batch is filtered in
//! memory. The `(account_id, ig_message_id)` unique index stays the real
//! guarantee; this only saves pointless inserts.

use std::collections::HashSet;
use std::sync::Arc;

use crate::data::Database;
use crate::error::AppError;

/// Ids bound per lookup query
pub const LOOKUP_CHUNK_SIZE: usize = 500;

pub struct MessageDeduplicator {
    db: Arc<Database>,
}

impl MessageDeduplicator {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Ids from `candidates` not yet stored for the account, in input order.
    pub async fn new_ids(
        &self,
        account_id: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, AppError> {
        let known = self.known_ids(account_id, candidates).await?;
        Ok(filter_new(candidates, &known))
    }

    pub async fn known_ids(
        &self,
        account_id: &str,
        candidates: &[String],
    ) -> Result<HashSet<String>, AppError> {
        let mut known = HashSet::new();
        for chunk in candidates.chunks(LOOKUP_CHUNK_SIZE) {
            known.extend(self.db.get_existing_message_ids(account_id, chunk).await?);
        }
        Ok(known)
    }
}

/// Drop ids present in `known` and repeated ids within the batch.
pub fn filter_new(candidates: &[String], known: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|id| !known.contains(*id) && seen.insert(id.as_str()))
        .cloned()
        .collect()
}
