//! Gatekeeper configuration.
//!
//! The config file is a JSON object mapping master URLs to lists of
//! *sections*. A section binds step-name sets and notification lists to a
//! master and carries a stable content hash so the debouncer can tell
//! "same rule fired before" apart from "rule changed".

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ConfigError;

/// Synthetic step name used when `respect_build_status` promotes an overall
/// build failure into the unsatisfied set.
pub const OVERALL_STATUS_STEP: &str = "[overall build status]";

fn default_status_template() -> String {
    "Tree is closed (Automatic: \"%(unsatisfied)s\" on \"%(builder_name)s\" %(blamelist)s)"
        .to_string()
}

fn default_subject_template() -> String {
    "buildbot %(result)s in %(project_name)s on %(builder_name)s, revision %(revision)s".to_string()
}

fn default_true() -> bool {
    true
}

/// One gatekeeper rule on a master.
///
/// A `*` entry in an *optional* set expands to every finished step not
/// excluded. Missing fields take the documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub closing_steps: BTreeSet<String>,
    #[serde(default)]
    pub forgiving_steps: BTreeSet<String>,
    #[serde(default)]
    pub closing_optional: BTreeSet<String>,
    #[serde(default)]
    pub forgiving_optional: BTreeSet<String>,
    #[serde(default)]
    pub excluded_steps: BTreeSet<String>,
    #[serde(default)]
    pub tree_notify: BTreeSet<String>,
    #[serde(default)]
    pub sheriff_classes: BTreeSet<String>,
    #[serde(default = "default_status_template")]
    pub status_template: String,
    #[serde(default = "default_subject_template")]
    pub subject_template: String,
    #[serde(default = "default_true")]
    pub close_tree: bool,
    #[serde(default)]
    pub respect_build_status: bool,
    #[serde(default)]
    pub excluded_builders: BTreeSet<String>,
    /// Stable content hash over the fields above; filled by `inject_hashes`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl Default for Section {
    fn default() -> Self {
        Self {
            closing_steps: BTreeSet::new(),
            forgiving_steps: BTreeSet::new(),
            closing_optional: BTreeSet::new(),
            forgiving_optional: BTreeSet::new(),
            excluded_steps: BTreeSet::new(),
            tree_notify: BTreeSet::new(),
            sheriff_classes: BTreeSet::new(),
            status_template: default_status_template(),
            subject_template: default_subject_template(),
            close_tree: true,
            respect_build_status: false,
            excluded_builders: BTreeSet::new(),
            hash: String::new(),
        }
    }
}

impl Section {
    /// Forgiving step names after exclusions; failures confined to these are
    /// mailed without blaming committers.
    pub fn forgiving_effective(&self, finished_steps: &BTreeSet<String>) -> BTreeSet<String> {
        let mut forgiving = self.forgiving_steps.clone();
        forgiving.extend(expand_optional(
            &self.forgiving_optional,
            finished_steps,
            &self.excluded_steps,
        ));
        forgiving
            .difference(&self.excluded_steps)
            .cloned()
            .collect()
    }

    /// Canonical JSON of the hashed fields: objects serialize with sorted
    /// keys and sets as sorted arrays, so the digest is stable across runs
    /// and input orderings.
    fn canonical_json(&self) -> serde_json::Value {
        let mut clean = self.clone();
        clean.hash = String::new();
        serde_json::to_value(&clean).unwrap_or(serde_json::Value::Null)
    }

    pub fn compute_hash(&self) -> String {
        let canonical = self.canonical_json().to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Expand a `*` wildcard in an optional step set to all finished,
/// non-excluded steps.
pub fn expand_optional(
    optional: &BTreeSet<String>,
    finished_steps: &BTreeSet<String>,
    excluded: &BTreeSet<String>,
) -> BTreeSet<String> {
    if optional.contains("*") {
        finished_steps.difference(excluded).cloned().collect()
    } else {
        optional.clone()
    }
}

/// Strip the trailing slash masters are commonly configured with.
pub fn normalize_master_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// The full gatekeeper config: master URL -> ordered list of sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    #[serde(flatten)]
    pub masters: BTreeMap<String, Vec<Section>>,
}

impl GatekeeperConfig {
    /// Load and structurally verify a config file. Unknown fields in
    /// sections are ignored; master URLs are normalized.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        verify_raw(&raw)?;
        let parsed: BTreeMap<String, Vec<Section>> =
            serde_json::from_value(raw).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let masters = parsed
            .into_iter()
            .map(|(url, sections)| (normalize_master_url(&url), sections))
            .collect();
        Ok(Self { masters })
    }

    /// Compute and attach each section's content hash. Idempotent: the hash
    /// field itself is excluded from the digest.
    pub fn inject_hashes(&mut self) {
        for sections in self.masters.values_mut() {
            for section in sections.iter_mut() {
                section.hash = section.compute_hash();
            }
        }
    }

    /// Specialize a section for one builder, or `None` when the builder is
    /// excluded by glob.
    pub fn section_for_builder(section: &Section, builder: &str) -> Option<Section> {
        for pattern in &section.excluded_builders {
            if let Ok(p) = glob::Pattern::new(pattern) {
                if p.matches(builder) {
                    return None;
                }
            }
        }
        Some(section.clone())
    }

    pub fn sections_for(&self, master: &str) -> &[Section] {
        self.masters
            .get(&normalize_master_url(master))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Fully expanded config with hashes, as deterministic pretty JSON.
    pub fn flatten(&self) -> String {
        serde_json::to_string_pretty(&self.masters).unwrap_or_default()
    }
}

const STRING_SET_FIELDS: &[&str] = &[
    "closing_steps",
    "forgiving_steps",
    "closing_optional",
    "forgiving_optional",
    "excluded_steps",
    "tree_notify",
    "sheriff_classes",
    "excluded_builders",
];

const BOOL_FIELDS: &[&str] = &["close_tree", "respect_build_status"];
const STRING_FIELDS: &[&str] = &["status_template", "subject_template", "hash"];

/// Structural schema check over the raw JSON, before serde drops unknown
/// fields. The wildcard `*` is only meaningful in the optional sets.
fn verify_raw(raw: &serde_json::Value) -> Result<(), ConfigError> {
    let map = raw.as_object().ok_or_else(|| ConfigError::InvalidSection {
        master: "<root>".into(),
        message: "config root must be an object".into(),
    })?;
    for (master, sections) in map {
        let invalid = |message: String| ConfigError::InvalidSection {
            master: master.clone(),
            message,
        };
        let list = sections
            .as_array()
            .ok_or_else(|| invalid("master must map to a list of sections".into()))?;
        for section in list {
            let obj = section
                .as_object()
                .ok_or_else(|| invalid("section must be an object".into()))?;
            for (key, value) in obj {
                if STRING_SET_FIELDS.contains(&key.as_str()) {
                    let items = value.as_array().ok_or_else(|| {
                        invalid(format!("field {} must be a list of strings", key))
                    })?;
                    for item in items {
                        let s = item.as_str().ok_or_else(|| {
                            invalid(format!("field {} must contain only strings", key))
                        })?;
                        if s.is_empty() {
                            return Err(invalid(format!("field {} contains an empty name", key)));
                        }
                        if s == "*" && !key.ends_with("_optional") {
                            return Err(invalid(format!(
                                "wildcard * is only allowed in optional sets, not {}",
                                key
                            )));
                        }
                    }
                } else if BOOL_FIELDS.contains(&key.as_str()) {
                    if !value.is_boolean() {
                        return Err(invalid(format!("field {} must be a bool", key)));
                    }
                } else if STRING_FIELDS.contains(&key.as_str()) && !value.is_string() {
                    return Err(invalid(format!("field {} must be a string", key)));
                }
                // Unknown fields are tolerated for forward compatibility.
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gatekeeper.json");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn load_applies_defaults_and_normalizes_urls() {
        let (_dir, path) =
            write_config(r#"{"http://master.example/": [{"closing_steps": ["compile"]}]}"#);
        let config = GatekeeperConfig::load(&path).unwrap();
        let sections = config.sections_for("http://master.example");
        assert_eq!(sections.len(), 1);
        let s = &sections[0];
        assert!(s.close_tree);
        assert!(!s.respect_build_status);
        assert!(s.closing_steps.contains("compile"));
        assert!(s.tree_notify.is_empty());
        assert!(s.status_template.contains("%(builder_name)s"));
    }

    #[test]
    fn load_ignores_unknown_fields() {
        let (_dir, path) = write_config(
            r#"{"http://m": [{"closing_steps": ["compile"], "some_future_field": 3}]}"#,
        );
        assert!(GatekeeperConfig::load(&path).is_ok());
    }

    #[test]
    fn load_rejects_wildcard_outside_optional_sets() {
        let (_dir, path) = write_config(r#"{"http://m": [{"closing_steps": ["*"]}]}"#);
        assert!(matches!(
            GatekeeperConfig::load(&path),
            Err(ConfigError::InvalidSection { .. })
        ));
    }

    #[test]
    fn load_rejects_non_list_master() {
        let (_dir, path) = write_config(r#"{"http://m": {"closing_steps": []}}"#);
        assert!(GatekeeperConfig::load(&path).is_err());
    }

    #[test]
    fn inject_hashes_is_deterministic_and_idempotent() {
        let (_dir, path) = write_config(
            r#"{"http://m": [{"closing_steps": ["b", "a"], "tree_notify": ["x@y.org"]}]}"#,
        );
        let mut one = GatekeeperConfig::load(&path).unwrap();
        one.inject_hashes();
        let first = one.masters["http://m"][0].hash.clone();
        assert!(!first.is_empty());

        one.inject_hashes();
        assert_eq!(one.masters["http://m"][0].hash, first);

        // Set ordering in the source file is irrelevant
        let (_dir2, path2) = write_config(
            r#"{"http://m": [{"tree_notify": ["x@y.org"], "closing_steps": ["a", "b"]}]}"#,
        );
        let mut two = GatekeeperConfig::load(&path2).unwrap();
        two.inject_hashes();
        assert_eq!(two.masters["http://m"][0].hash, first);
    }

    #[test]
    fn hash_changes_when_observable_fields_change() {
        let mut a = Section::default();
        a.closing_steps.insert("compile".into());
        let mut b = a.clone();
        b.close_tree = false;
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn section_for_builder_applies_exclusion_globs() {
        let mut section = Section::default();
        section.excluded_builders.insert("Win*".into());
        assert!(GatekeeperConfig::section_for_builder(&section, "Win7 Tests").is_none());
        assert!(GatekeeperConfig::section_for_builder(&section, "Linux Tests").is_some());
    }

    #[test]
    fn expand_optional_replaces_wildcard() {
        let optional: BTreeSet<String> = ["*".to_string()].into();
        let finished: BTreeSet<String> =
            ["compile".to_string(), "test".to_string(), "sync".to_string()].into();
        let excluded: BTreeSet<String> = ["compile".to_string()].into();
        let expanded = expand_optional(&optional, &finished, &excluded);
        assert_eq!(expanded, ["test".to_string(), "sync".to_string()].into());

        let plain: BTreeSet<String> = ["test".to_string()].into();
        assert_eq!(expand_optional(&plain, &finished, &excluded), plain);
    }

    #[test]
    fn flatten_is_byte_identical_across_loads() {
        let (_dir, path) =
            write_config(r#"{"http://m": [{"closing_steps": ["compile"]}], "http://n/": [{}]}"#);
        let mut one = GatekeeperConfig::load(&path).unwrap();
        one.inject_hashes();
        let mut two = GatekeeperConfig::load(&path).unwrap();
        two.inject_hashes();
        assert_eq!(one.flatten(), two.flatten());
    }
}
