//! Revision tracking: fire at most once per revision set.
//!
//! The last-fired value of each configured build property is stored in the
//! build db's aux map under `triggered_revisions`. A failing build only
//! passes when it is strictly newer than what already fired; equal or older
//! revisions are dropped so a flaky builder cannot re-close the tree on the
//! same commit.

use std::collections::{BTreeMap, BTreeSet};

use crate::build_db::TRIGGERED_REVISIONS_KEY;
use crate::classifier::Failure;
use crate::properties::{PropValue, normalize_commit_position};

pub struct RevisionFilter {
    properties: Vec<String>,
}

type Aux = BTreeMap<String, serde_json::Value>;

impl RevisionFilter {
    pub fn new(properties: Vec<String>) -> Self {
        Self { properties }
    }

    fn load_stored(&self, aux: &Aux) -> BTreeMap<String, PropValue> {
        let stored: BTreeMap<String, PropValue> = aux
            .get(TRIGGERED_REVISIONS_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        // A change in the tracked property set invalidates prior history.
        let configured: BTreeSet<&str> = self.properties.iter().map(String::as_str).collect();
        let stored_keys: BTreeSet<&str> = stored.keys().map(String::as_str).collect();
        if stored_keys != configured {
            if !stored.is_empty() {
                tracing::info!(
                    "tracked revision properties changed, discarding stored triggered_revisions"
                );
            }
            return BTreeMap::new();
        }
        stored
    }

    fn store(&self, aux: &mut Aux, values: &BTreeMap<String, PropValue>) {
        if let Ok(v) = serde_json::to_value(values) {
            aux.insert(TRIGGERED_REVISIONS_KEY.to_string(), v);
        }
    }

    /// Current revision values for one build: configured property values
    /// with commit-position footers normalized to integers. Missing
    /// properties map to `None`.
    fn current_revisions(&self, failure: &Failure) -> BTreeMap<String, Option<PropValue>> {
        self.properties
            .iter()
            .map(|name| {
                let value = failure
                    .tuple
                    .build
                    .property(name)
                    .map(normalize_commit_position);
                (name.clone(), value)
            })
            .collect()
    }

    /// Trim failures to builds carrying unseen revisions, recording each
    /// passing build before older ones are considered.
    pub fn filter(&self, aux: &mut Aux, failures: Vec<Failure>) -> Vec<Failure> {
        if self.properties.is_empty() {
            return failures;
        }
        let mut stored = self.load_stored(aux);

        // Evaluate each distinct build once, newest start time first, so the
        // freshest failure wins the stored slot.
        let mut order: Vec<&Failure> = failures.iter().collect();
        order.sort_by(|a, b| {
            let at = a.tuple.build.start_time();
            let bt = b.tuple.build.start_time();
            bt.partial_cmp(&at).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut passed_builds: BTreeSet<String> = BTreeSet::new();
        let mut seen_builds: BTreeSet<String> = BTreeSet::new();
        for failure in order {
            let key = failure.tuple.key().to_string();
            if !seen_builds.insert(key.clone()) {
                continue;
            }
            let current = self.current_revisions(failure);

            if current.values().any(Option::is_none) {
                // Can't compare without the property; pass and record what
                // is there so the next run has a baseline.
                tracing::warn!(build = %failure.tuple.key(), "build missing tracked revision properties");
                let partial: BTreeMap<String, PropValue> = current
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone().unwrap_or(PropValue::Null)))
                    .collect();
                self.store(aux, &partial);
                stored = partial;
                passed_builds.insert(key);
                continue;
            }

            let current: BTreeMap<String, PropValue> = current
                .into_iter()
                .map(|(k, v)| (k, v.unwrap_or(PropValue::Null)))
                .collect();

            if self.is_newer(&stored, &current) {
                self.store(aux, &current);
                stored = current;
                passed_builds.insert(key);
            } else {
                tracing::debug!(build = %failure.tuple.key(), "revision already triggered, dropping failure");
            }
        }

        failures
            .into_iter()
            .filter(|f| passed_builds.contains(&f.tuple.key().to_string()))
            .collect()
    }

    /// True when `current` is componentwise >= `stored` with at least one
    /// strictly greater component. An empty store passes everything.
    fn is_newer(
        &self,
        stored: &BTreeMap<String, PropValue>,
        current: &BTreeMap<String, PropValue>,
    ) -> bool {
        if stored.is_empty() {
            return true;
        }
        let mut any_greater = false;
        for (name, cur) in current {
            let Some(prev) = stored.get(name) else {
                return true;
            };
            match cur.compare(prev) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Greater => any_greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        any_greater
    }
}
