//! Free-text validator lookup.
//!
//! Rules are tried in order, case-insensitively, and the first one with a
//! hit wins:
//! 1. exact identity
//! 2. exact display name
//! 3. display name contains the query (every hit becomes a suggestion)
//!
//! A lone substring hit is promoted to a match. Capping the suggestion list
//! for display is the caller's job.

use crate::snapshot::{Snapshot, ValidatorRecord};

/// Outcome of a lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution<'a> {
    pub single_match: Option<&'a ValidatorRecord>,
    pub suggestions: Vec<&'a ValidatorRecord>,
}

impl Resolution<'_> {
    pub fn is_not_found(&self) -> bool {
        self.single_match.is_none() && self.suggestions.is_empty()
    }
}

pub fn resolve<'a>(query: &str, snapshot: &'a Snapshot) -> Resolution<'a> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return Resolution::default();
    }

    let validators = snapshot.validators();

    if let Some(v) = validators
        .iter()
        .find(|v| v.identity.to_lowercase() == query)
    {
        return Resolution {
            single_match: Some(v),
            suggestions: Vec::new(),
        };
    }

    if let Some(v) = validators
        .iter()
        .find(|v| display_name(v).is_some_and(|n| n == query))
    {
        return Resolution {
            single_match: Some(v),
            suggestions: Vec::new(),
        };
    }

    let mut suggestions: Vec<&ValidatorRecord> = validators
        .iter()
        .filter(|v| display_name(v).is_some_and(|n| n.contains(&query)))
        .collect();

    if suggestions.len() == 1 {
        return Resolution {
            single_match: suggestions.pop(),
            suggestions: Vec::new(),
        };
    }

    Resolution {
        single_match: None,
        suggestions,
    }
}

fn display_name(v: &ValidatorRecord) -> Option<String> {
    v.name.as_deref().map(str::to_lowercase)
}
