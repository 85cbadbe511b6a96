//! # Similarity ranking
//!
//! Turns raw index neighbors into scored CRM hits: distances become bounded
//! similarity scores, results under the threshold are dropped, and surviving
//! rows are joined back to the entity they were built from.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::entity::{EntityRecord, EntityType, IndexedEntityMetadata};
use crate::index::Neighbor;

/// A ranked semantic search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub entity: EntityRecord,
    pub entity_type: EntityType,
    /// `1 / (1 + distance)`: 1.0 for an exact match, approaching 0 with distance.
    pub score: f32,
    pub distance: f32,
    pub row_index: usize,
}

/// Map an L2 distance onto `(0, 1]`, decreasing monotonically.
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Score, filter and join `neighbors` (already nearest-first).
///
/// Rows with no metadata entry are skipped. When `entity_type` is set only
/// rows of that type are kept. At most `k` hits are returned.
pub(crate) fn rank(
    neighbors: Vec<Neighbor>,
    metadata: &BTreeMap<usize, IndexedEntityMetadata>,
    k: usize,
    threshold: f32,
    entity_type: Option<EntityType>,
) -> Vec<SearchHit> {
    neighbors
        .into_iter()
        .filter_map(|n| {
            let score = distance_to_score(n.distance);
            if score < threshold {
                return None;
            }
            let meta = metadata.get(&n.row)?;
            if entity_type.is_some_and(|t| t != meta.entity_type) {
                return None;
            }
            Some(SearchHit {
                entity: meta.entity.clone(),
                entity_type: meta.entity_type,
                score,
                distance: n.distance,
                row_index: n.row,
            })
        })
        .take(k)
        .collect()
}
