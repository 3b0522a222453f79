//! Warn-once registry and diagnostic helpers
//!
//! Several per-feature problems are reported only the first time they occur, no matter
//! how many segments run in parallel. [`Diagnostics`] is shared by reference between all
//! workers of a run and flips each category exactly once.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Maximum length of the JSON snippet attached to diagnostics
pub const CONTEXT_LIMIT: usize = 500;

/// Warning categories that are reported at most once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    NullGeometry,
    FractionalId,
    NegativeId,
    NonNumericId,
    ExtraDimensions,
}

impl Warning {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            Warning::NullGeometry => 0,
            Warning::FractionalId => 1,
            Warning::NegativeId => 2,
            Warning::NonNumericId => 3,
            Warning::ExtraDimensions => 4,
        }
    }
}

/// Process-wide warn-once flags and shared high-water marks
#[derive(Debug, Default)]
pub struct Diagnostics {
    fired: [AtomicBool; Warning::COUNT],
    occurrences: [AtomicU64; Warning::COUNT],
    /// Largest tile replication estimate reported so far for unclipped features
    unclipped_extent: AtomicI64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an occurrence of `warning`, returning `true` only for the very first one
    pub fn first(&self, warning: Warning) -> bool {
        let slot = warning.slot();
        self.occurrences[slot].fetch_add(1, Ordering::Relaxed);
        !self.fired[slot].swap(true, Ordering::AcqRel)
    }

    /// Whether `warning` has been reported
    pub fn emitted(&self, warning: Warning) -> bool {
        self.fired[warning.slot()].load(Ordering::Acquire)
    }

    /// How many times `warning` occurred, reported or not
    pub fn occurrences(&self, warning: Warning) -> u64 {
        self.occurrences[warning.slot()].load(Ordering::Relaxed)
    }

    /// Raise the unclipped-feature high-water mark, returning `true` if `extent` exceeds it
    pub fn raise_unclipped_extent(&self, extent: i64) -> bool {
        self.unclipped_extent.fetch_max(extent, Ordering::AcqRel) < extent
    }
}

/// Render a JSON value for a diagnostic message, truncated to [`CONTEXT_LIMIT`] characters
pub fn json_context(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() < CONTEXT_LIMIT {
        return text;
    }

    let mut truncated: String = text.chars().take(CONTEXT_LIMIT - 3).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_fires_once() {
        let diagnostics = Diagnostics::new();
        assert!(diagnostics.first(Warning::NegativeId));
        assert!(!diagnostics.first(Warning::NegativeId));
        assert!(!diagnostics.first(Warning::NegativeId));
        assert_eq!(diagnostics.occurrences(Warning::NegativeId), 3);

        // Categories are independent
        assert!(!diagnostics.emitted(Warning::FractionalId));
        assert!(diagnostics.first(Warning::FractionalId));
    }

    #[test]
    fn test_first_fires_once_across_threads() {
        let diagnostics = Diagnostics::new();
        let fired: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..100).filter(|_| diagnostics.first(Warning::NonNumericId)).count()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(fired, 1);
        assert_eq!(diagnostics.occurrences(Warning::NonNumericId), 800);
    }

    #[test]
    fn test_unclipped_high_water_mark() {
        let diagnostics = Diagnostics::new();
        assert!(diagnostics.raise_unclipped_extent(10));
        assert!(!diagnostics.raise_unclipped_extent(5));
        assert!(!diagnostics.raise_unclipped_extent(10));
        assert!(diagnostics.raise_unclipped_extent(11));
    }

    #[test]
    fn test_json_context_truncates() {
        let short = json!({"a": 1});
        assert_eq!(json_context(&short), r#"{"a":1}"#);

        let long = json!({"text": "x".repeat(2000)});
        let context = json_context(&long);
        assert_eq!(context.chars().count(), CONTEXT_LIMIT);
        assert!(context.ends_with("..."));
    }
}
