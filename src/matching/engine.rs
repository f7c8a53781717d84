//! `MatchingEngine`: gather, deduplicate, score, gate, rank.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::scoring;
use super::types::{MatchCandidate, MatchCriteria};
use crate::error::DatabaseError;
use crate::inventory::{InventoryItem, InventorySource};

/// Candidates below this total are never returned.
pub const MIN_TOTAL: u8 = 30;
/// Candidates below this destination score are never returned, whatever their total.
pub const MIN_DESTINATION: u8 = 20;
/// At most this many candidates are returned.
pub const MAX_RESULTS: usize = 5;

pub struct MatchingEngine {
    inventory: Arc<dyn InventorySource>,
}

impl MatchingEngine {
    pub fn new(inventory: Arc<dyn InventorySource>) -> Self {
        Self { inventory }
    }

    /// Rank this tenant's inventory against `criteria`.
    ///
    /// Supplier offers are gathered before the catalog, so on a duplicate
    /// (title, destination) the supplier offer wins.
    pub async fn match_packages(
        &self,
        criteria: &MatchCriteria,
        tenant_id: &str,
    ) -> Result<Vec<MatchCandidate>, DatabaseError> {
        let mut items = self.inventory.verified_offers(tenant_id).await?;
        items.extend(self.inventory.published_itineraries(tenant_id).await?);

        let gathered = items.len();
        let ranked = rank(criteria, items);
        debug!(
            tenant_id,
            gathered,
            returned = ranked.len(),
            top = ranked.first().map(|c| c.total).unwrap_or(0),
            "Matched packages"
        );
        Ok(ranked)
    }
}

/// Keep the first item per case-insensitive (title, destination).
pub fn dedup(items: Vec<InventoryItem>) -> Vec<InventoryItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.dedup_key()))
        .collect()
}

/// Pure ranking over an already-gathered candidate list.
pub fn rank(criteria: &MatchCriteria, items: Vec<InventoryItem>) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = dedup(items)
        .into_iter()
        .filter_map(|item| {
            let scores = scoring::score(criteria, &item);
            let total = scores.total();
            if total < MIN_TOTAL || scores.destination < MIN_DESTINATION {
                return None;
            }
            Some(MatchCandidate {
                reasons: scoring::reasons(&scores, criteria, &item),
                gaps: scoring::gaps(&scores, criteria, &item),
                item,
                scores,
                total,
            })
        })
        .collect();

    // Stable: equal totals keep discovery order.
    candidates.sort_by(|a, b| b.total.cmp(&a.total));
    candidates.truncate(MAX_RESULTS);
    candidates
}
