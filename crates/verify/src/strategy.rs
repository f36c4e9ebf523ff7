//! Rebuild-strategy classification
//!
//! Given how much of a project diverged, advise the caller on how to
//! bring the graph back in sync. The strategy is advisory; execution is
//! up to the consumer.

use serde::{Deserialize, Serialize};

/// Advised response to detected divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildStrategy {
    /// Nothing changed
    None,
    /// A handful of files: patch inline without surfacing progress
    InlineSilent,
    /// Enough files that the caller should show status while patching
    InlineWithStatus,
    /// Large or proportionally significant change: rebuild the affected
    /// portion in the background
    BackgroundPartial,
    /// Most of the project diverged: rebuild from scratch
    FullRebuild,
}

impl RebuildStrategy {
    /// Classify by changed-file count and fraction of the project.
    ///
    /// `changed` counts stale plus deleted files; `total` is the number of
    /// files the graph covers.
    #[must_use]
    pub fn classify(changed: usize, total: usize) -> Self {
        if changed == 0 {
            return Self::None;
        }
        let fraction = changed as f64 / total.max(1) as f64;
        if fraction > 0.5 {
            return Self::FullRebuild;
        }
        if changed >= 11 || fraction > 0.2 {
            return Self::BackgroundPartial;
        }
        if changed >= 4 {
            return Self::InlineWithStatus;
        }
        Self::InlineSilent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_change() {
        assert_eq!(RebuildStrategy::classify(0, 100), RebuildStrategy::None);
        assert_eq!(RebuildStrategy::classify(0, 0), RebuildStrategy::None);
    }

    #[test]
    fn test_small_counts_inline() {
        assert_eq!(
            RebuildStrategy::classify(1, 100),
            RebuildStrategy::InlineSilent
        );
        assert_eq!(
            RebuildStrategy::classify(3, 100),
            RebuildStrategy::InlineSilent
        );
        assert_eq!(
            RebuildStrategy::classify(4, 100),
            RebuildStrategy::InlineWithStatus
        );
        assert_eq!(
            RebuildStrategy::classify(10, 100),
            RebuildStrategy::InlineWithStatus
        );
    }

    #[test]
    fn test_medium_counts_background() {
        assert_eq!(
            RebuildStrategy::classify(11, 100),
            RebuildStrategy::BackgroundPartial
        );
        assert_eq!(
            RebuildStrategy::classify(50, 200),
            RebuildStrategy::BackgroundPartial
        );
        // Count above fifty stays background while under half the project
        assert_eq!(
            RebuildStrategy::classify(60, 1000),
            RebuildStrategy::BackgroundPartial
        );
    }

    #[test]
    fn test_fraction_promotes_small_counts() {
        // 3 of 10 files is over twenty percent
        assert_eq!(
            RebuildStrategy::classify(3, 10),
            RebuildStrategy::BackgroundPartial
        );
    }

    #[test]
    fn test_majority_forces_full_rebuild() {
        assert_eq!(
            RebuildStrategy::classify(51, 100),
            RebuildStrategy::FullRebuild
        );
        assert_eq!(RebuildStrategy::classify(2, 2), RebuildStrategy::FullRebuild);
    }
}
