//! Failure debouncing: never fire twice for the same reason.
//!
//! Two guards per (build, section): the section's hash must not already be
//! recorded on the build, and the unsatisfied set must contain at least one
//! step that was not already unsatisfied on the previous build of the same
//! builder. Trigger records are written back regardless of the verdict so
//! the next run sees this build as the new baseline.

use std::collections::BTreeSet;

use crate::build_db::BuildDb;
use crate::classifier::Failure;

/// Trim failures to those worth firing on, recording trigger state.
pub fn debounce(
    db: &mut BuildDb,
    failures: Vec<Failure>,
    current_builds_successful: bool,
) -> Vec<Failure> {
    // Failures that are strictly older than successful newer runs never fire.
    if current_builds_successful && !failures.is_empty() {
        tracing::info!(
            count = failures.len(),
            "current builds are successful, dropping stale failures"
        );
        return Vec::new();
    }

    let mut kept = Vec::new();
    for failure in failures {
        let tuple = &failure.tuple;
        let hash = failure.section.hash.clone();

        let already_triggered = db
            .get(&tuple.master, &tuple.builder, tuple.number)
            .map(|entry| entry.triggered.contains_key(&hash))
            .unwrap_or(false);

        let previous_unsatisfied: BTreeSet<String> = tuple
            .number
            .checked_sub(1)
            .and_then(|prev| db.get(&tuple.master, &tuple.builder, prev))
            .and_then(|entry| entry.triggered.get(&hash).cloned())
            .unwrap_or_default();

        let new_steps: BTreeSet<String> = failure
            .unsatisfied
            .difference(&previous_unsatisfied)
            .cloned()
            .collect();

        let keep = if already_triggered {
            tracing::debug!(build = %tuple.key(), "section already fired on this build");
            false
        } else if new_steps.is_empty() {
            tracing::debug!(
                build = %tuple.key(),
                "unsatisfied steps unchanged from previous build"
            );
            false
        } else {
            true
        };

        db.get_or_create(&tuple.master, &tuple.builder, tuple.number)
            .triggered
            .insert(hash, failure.unsatisfied.clone());

        if keep {
            kept.push(failure);
        }
    }
    kept
}
