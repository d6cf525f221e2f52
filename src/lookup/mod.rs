//! Validator lookup for command handlers and the dashboard.
//!
//! Reads the cached snapshot (TTL-bounded, never forced) and runs the
//! resolver over it. Results are owned so they outlive the snapshot read.

use crate::resolver::resolve;
use crate::snapshot::{Freshness, SnapshotCache, ValidatorRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Suggestions returned for an ambiguous query.
pub const MAX_SUGGESTIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LookupResult {
    Found {
        record: ValidatorRecord,
        /// 1-based position by activated stake.
        rank: Option<usize>,
    },
    Ambiguous {
        suggestions: Vec<ValidatorRecord>,
    },
    NotFound,
    /// No snapshot has ever been loaded.
    Unavailable,
}

#[derive(Clone)]
pub struct Lookup {
    cache: Arc<SnapshotCache>,
}

impl Lookup {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    pub async fn find(&self, query: &str) -> LookupResult {
        let (snapshot, freshness) = self.cache.read(false).await;
        if freshness == Freshness::Unavailable || snapshot.is_empty() {
            return LookupResult::Unavailable;
        }

        let resolution = resolve(query, &snapshot);
        let result = if let Some(record) = resolution.single_match {
            LookupResult::Found {
                rank: snapshot.rank_of(&record.identity),
                record: record.clone(),
            }
        } else if resolution.suggestions.is_empty() {
            LookupResult::NotFound
        } else {
            LookupResult::Ambiguous {
                suggestions: resolution
                    .suggestions
                    .into_iter()
                    .take(MAX_SUGGESTIONS)
                    .cloned()
                    .collect(),
            }
        };
        debug!(query = %query, freshness = ?freshness, "lookup resolved");
        result
    }

    /// Largest validators by activated stake.
    pub async fn top(&self, n: usize) -> Vec<ValidatorRecord> {
        let snapshot = self.cache.get(false).await;
        snapshot.top_by_stake(n).into_iter().cloned().collect()
    }
}
