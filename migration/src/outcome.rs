//! Per-experiment and process-wide migration tallies.

use std::fmt;

use serde::Serialize;

/// Counter triple for one experiment's migration. Created fresh per
/// invocation and never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunTally {
    /// Runs copied completely (artifact warnings included).
    pub success: usize,
    /// Runs whose copy raised and was counted.
    pub failed: usize,
    /// Runs skipped because they were not finished.
    pub skipped: usize,
}

impl RunTally {
    /// Total runs processed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.success + self.failed + self.skipped
    }

    /// Folds another tally into this one.
    pub fn merge(&mut self, other: Self) {
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Process-wide aggregate across every migrated experiment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Number of experiments attempted.
    pub experiments: usize,
    /// Aggregated run tally.
    pub tally: RunTally,
}

impl MigrationReport {
    /// Wraps a single experiment's tally.
    #[must_use]
    pub const fn single(tally: RunTally) -> Self {
        Self {
            experiments: 1,
            tally,
        }
    }

    /// Adds one experiment's outcome.
    pub fn absorb(&mut self, tally: RunTally) {
        self.experiments += 1;
        self.tally.merge(tally);
    }

    /// Process exit status: non-zero iff any run failed. Skipped runs and
    /// swallowed artifact warnings never affect it.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.tally.failed > 0 {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(80))?;
        writeln!(f, "MIGRATION SUMMARY")?;
        writeln!(f, "{}", "=".repeat(80))?;
        writeln!(f, "Experiments migrated: {}", self.experiments)?;
        writeln!(f, "Runs successfully migrated: {}", self.tally.success)?;
        writeln!(f, "Runs failed: {}", self.tally.failed)?;
        writeln!(f, "Runs skipped: {}", self.tally.skipped)?;
        writeln!(f, "Total runs processed: {}", self.tally.total())?;
        write!(f, "{}", "=".repeat(80))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_componentwise() {
        let mut left = RunTally {
            success: 2,
            failed: 1,
            skipped: 0,
        };
        left.merge(RunTally {
            success: 1,
            failed: 0,
            skipped: 3,
        });
        assert_eq!(
            left,
            RunTally {
                success: 3,
                failed: 1,
                skipped: 3
            }
        );
        assert_eq!(left.total(), 7);
    }

    #[test]
    fn exit_code_tracks_failures_only() {
        let mut report = MigrationReport::default();
        report.absorb(RunTally {
            success: 5,
            failed: 0,
            skipped: 9,
        });
        assert_eq!(report.exit_code(), 0);
        report.absorb(RunTally {
            success: 0,
            failed: 1,
            skipped: 0,
        });
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.experiments, 2);
    }

    #[test]
    fn summary_mentions_every_counter() {
        let report = MigrationReport::single(RunTally {
            success: 2,
            failed: 0,
            skipped: 1,
        });
        let rendered = report.to_string();
        assert!(rendered.contains("Runs successfully migrated: 2"));
        assert!(rendered.contains("Runs skipped: 1"));
        assert!(rendered.contains("Total runs processed: 3"));
    }
}
