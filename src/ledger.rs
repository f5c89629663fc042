// 📒 Dedup Ledger - processed loan ids plus the resume cursor
//
// The id set makes re-folding a loan a no-op. The cursor says which
// snapshot batch comes next and only moves once a batch is in the graph;
// the caller flushes right after, so a crash mid-batch replays that batch.
//
// Loans whose lender list could not be fetched wait in the retry queue.
// Listings and the cursor have already moved past them, so the queue is
// the only way they come around again.

use crate::geo::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot files are numbered from 1
pub const FIRST_BATCH: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupLedger {
    /// Next snapshot batch to read
    #[serde(rename = "file_num", default = "first_batch")]
    cursor: u32,

    #[serde(default)]
    processed: BTreeSet<String>,

    /// Loan id → loan location, for loans to fold again next run
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    retry: BTreeMap<String, Location>,

    /// Last time the cursor moved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

fn first_batch() -> u32 {
    FIRST_BATCH
}

impl Default for DedupLedger {
    fn default() -> Self {
        DedupLedger {
            cursor: FIRST_BATCH,
            processed: BTreeSet::new(),
            retry: BTreeMap::new(),
            updated_at: None,
        }
    }
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_processed(&self, record_id: &str) -> bool {
        self.processed.contains(record_id)
    }

    /// Returns `true` the first time an id is marked.
    pub fn mark_processed(&mut self, record_id: &str) -> bool {
        self.retry.remove(record_id);
        if self.processed.contains(record_id) {
            return false;
        }
        self.processed.insert(record_id.to_string())
    }

    /// Park a loan for the next run. Processed loans are never queued.
    pub fn queue_retry(&mut self, record_id: &str, location: &Location) -> bool {
        if self.processed.contains(record_id) {
            return false;
        }
        self.retry.insert(record_id.to_string(), location.clone());
        true
    }

    pub fn is_queued_for_retry(&self, record_id: &str) -> bool {
        self.retry.contains_key(record_id)
    }

    /// Snapshot of the retry queue, ordered by id
    pub fn retry_queue(&self) -> Vec<(String, Location)> {
        self.retry
            .iter()
            .map(|(id, location)| (id.clone(), location.clone()))
            .collect()
    }

    pub fn retry_count(&self) -> usize {
        self.retry.len()
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Move past the batch that was just folded.
    pub fn advance_cursor(&mut self) -> u32 {
        self.cursor += 1;
        self.updated_at = Some(Utc::now());
        self.cursor
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn processed_ids(&self) -> impl Iterator<Item = &str> {
        self.processed.iter().map(String::as_str)
    }
}
