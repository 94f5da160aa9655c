//! Click-through counters.
//!
//! A persistent doc-id → click-count map kept on its own DB tree, with the
//! full count list warmed into memory on open. Doc ids start from 1.

use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::aggregator::ServiceHandler;
use crate::database::{Database, Tree};
use crate::utils;
use shoal_core::reqtype::WriteReqType;

/// The default doc-id capacity reserved by the daemon's built-in counter.
pub const DEFAULT_DOC_CAPACITY: usize = 1 << 20;

/// A persistent click-through counter map for one collection.
pub struct ClickCounter {
    tree: Tree,
    counts: Mutex<Vec<u32>>,
}

impl ClickCounter {
    /// Open the counter store, warming counts from disk.
    pub async fn open(db: &Database, doc_capacity: usize) -> Result<Self> {
        let tree = db.get_ctr_tree().await?;
        let warm_tree = tree.clone();
        let counts = Database::spawn_blocking(move || -> Result<Vec<u32>> {
            let mut counts = vec![0u32; doc_capacity + 1];
            for kv_res in warm_tree.iter() {
                let (key, val) = kv_res.context("error iterating click count records")?;
                let doc_id = utils::decode_u32(&key).context("error decoding click count doc id, data corrupted")?;
                let count = utils::decode_u32(&val).context("error decoding click count value, data corrupted")?;
                if let Some(slot) = counts.get_mut(doc_id as usize) {
                    *slot = count;
                }
            }
            Ok(counts)
        })
        .await??;
        Ok(Self { tree, counts: Mutex::new(counts) })
    }

    /// Record one click for the given doc, persisting the new count.
    ///
    /// Returns `false` for doc ids outside of the reserved capacity.
    pub fn update(&self, doc_id: u32) -> Result<bool> {
        let count = {
            let mut counts = self.counts.lock().expect("click counts lock poisoned");
            let slot = match counts.get_mut(doc_id as usize) {
                Some(slot) if doc_id > 0 => slot,
                _ => return Ok(false),
            };
            *slot += 1;
            *slot
        };
        self.tree
            .insert(utils::encode_u32(doc_id), &utils::encode_u32(count))
            .context("error persisting click count")?;
        self.tree.flush().context("error flushing click count store")?;
        Ok(true)
    }

    /// The current click count of a doc.
    pub fn count(&self, doc_id: u32) -> u32 {
        let counts = self.counts.lock().expect("click counts lock poisoned");
        counts.get(doc_id as usize).copied().unwrap_or(0)
    }

    /// Positional click counts for a result list: `(position, count)` for
    /// every doc in the list with a non-zero count.
    pub fn click_counts(&self, doc_ids: &[u32]) -> Vec<(usize, u32)> {
        let counts = self.counts.lock().expect("click counts lock poisoned");
        doc_ids
            .iter()
            .enumerate()
            .filter_map(|(pos, doc_id)| match counts.get(*doc_id as usize) {
                Some(count) if *count > 0 => Some((pos, *count)),
                _ => None,
            })
            .collect()
    }
}

/// The daemon's built-in service handler: visit-style requests bump the
/// click counter, everything else is acknowledged for the indexing layers
/// to pick up.
pub struct ClickCountHandler {
    ctr: ClickCounter,
}

impl ClickCountHandler {
    pub fn new(ctr: ClickCounter) -> Self {
        Self { ctr }
    }

    /// The counter store behind this handler.
    pub fn counter(&self) -> &ClickCounter {
        &self.ctr
    }
}

impl ServiceHandler for ClickCountHandler {
    fn apply(&self, reqtype: WriteReqType, payload: &[u8]) -> Result<()> {
        match reqtype {
            WriteReqType::DocumentsVisit | WriteReqType::RecommendVisitItem => {
                let doc_id: u32 = std::str::from_utf8(payload)
                    .ok()
                    .and_then(|raw| raw.trim().parse().ok())
                    .context("visit request payload is not a doc id")?;
                self.ctr.update(doc_id)?;
                Ok(())
            }
            _ => {
                tracing::debug!(reqtype = %reqtype, "write request acknowledged without a local executor");
                Ok(())
            }
        }
    }
}
