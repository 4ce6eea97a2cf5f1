//! Build classification.
//!
//! Decides, per (build, section), whether the build satisfies the section.
//! Builds arrive newest-first; successful step names accumulate per builder
//! as the batch is walked, so an old failure whose every unsatisfied step
//! has since gone green is treated as resolved rather than reported.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{GatekeeperConfig, OVERALL_STATUS_STEP, Section, expand_optional};
use crate::model::{BuildTuple, is_failure};

/// One build failing one section.
#[derive(Debug, Clone)]
pub struct Failure {
    pub tuple: BuildTuple,
    pub section: Section,
    pub unsatisfied: BTreeSet<String>,
}

/// Successful step names seen so far, per (master, builder).
pub type BuilderSteps = BTreeMap<(String, String), BTreeSet<String>>;

#[derive(Debug, Default)]
pub struct Classification {
    pub failures: Vec<Failure>,
    /// Finished builds that satisfied every applicable section.
    pub succeeded: Vec<BuildTuple>,
    pub successful_builder_steps: BuilderSteps,
    /// True while no live failure has been reported: every failing step in
    /// the batch has since succeeded on a newer build.
    pub current_builds_successful: bool,
}

/// Unsatisfied step names for one build against one section.
pub fn unsatisfied_steps(tuple: &BuildTuple, section: &Section) -> BTreeSet<String> {
    let build = &tuple.build;
    let finished_steps = build.finished_steps();
    let successful_steps = build.successful_steps();

    let closing_optional = expand_optional(
        &section.closing_optional,
        &finished_steps,
        &section.excluded_steps,
    );
    let forgiving_optional = expand_optional(
        &section.forgiving_optional,
        &finished_steps,
        &section.excluded_steps,
    );

    let closing_effective: BTreeSet<String> = section
        .closing_steps
        .union(&section.forgiving_steps)
        .cloned()
        .collect::<BTreeSet<_>>()
        .difference(&section.excluded_steps)
        .cloned()
        .collect();
    let optional_effective: BTreeSet<String> = closing_optional
        .union(&forgiving_optional)
        .cloned()
        .collect::<BTreeSet<_>>()
        .difference(&section.excluded_steps)
        .cloned()
        .collect();

    let mut unsatisfied: BTreeSet<String> = closing_effective
        .difference(&successful_steps)
        .cloned()
        .collect();
    let failed_finished: BTreeSet<String> = finished_steps
        .difference(&successful_steps)
        .cloned()
        .collect();
    unsatisfied.extend(failed_finished.intersection(&optional_effective).cloned());

    // An unfinished build is only on the hook for steps that actually ran.
    if !build.is_finished() {
        unsatisfied = unsatisfied.intersection(&finished_steps).cloned().collect();
    }

    if unsatisfied.is_empty()
        && section.respect_build_status
        && build.results.is_some_and(is_failure)
    {
        unsatisfied.insert(OVERALL_STATUS_STEP.to_string());
    }

    unsatisfied
}

/// Classify a batch of builds (sorted newest-first) against the config.
pub fn classify(config: &GatekeeperConfig, build_tuples: &[BuildTuple]) -> Classification {
    let mut out = Classification {
        current_builds_successful: true,
        ..Default::default()
    };

    for tuple in build_tuples {
        let builder_key = (tuple.master.clone(), tuple.builder.clone());
        let mut any_unsatisfied = false;

        for section in config.sections_for(&tuple.master) {
            let Some(section) = GatekeeperConfig::section_for_builder(section, &tuple.builder)
            else {
                continue;
            };
            let unsatisfied = unsatisfied_steps(tuple, &section);
            if unsatisfied.is_empty() {
                continue;
            }
            any_unsatisfied = true;

            // Resolved if every failing step has succeeded on a newer build
            // of this builder.
            let newer_ok = out
                .successful_builder_steps
                .get(&builder_key)
                .cloned()
                .unwrap_or_default();
            if unsatisfied.iter().all(|s| newer_ok.contains(s)) {
                tracing::debug!(
                    build = %tuple.key(),
                    "failure resolved by newer successful build, not reporting"
                );
                continue;
            }

            out.current_builds_successful = false;
            out.failures.push(Failure {
                tuple: tuple.clone(),
                section,
                unsatisfied,
            });
        }

        if tuple.build.is_finished() && !any_unsatisfied {
            out.succeeded.push(tuple.clone());
        }

        out.successful_builder_steps
            .entry(builder_key)
            .or_default()
            .extend(tuple.build.successful_steps());
    }

    out
}
