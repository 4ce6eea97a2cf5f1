//! Durable per-build record store.
//!
//! The build db remembers, per (master, builder, number), whether a build
//! finished and succeeded and which gatekeeper sections have already fired
//! on it, plus a free-form `aux` map for global state (last-triggered
//! revisions, last closure message per tree). It is loaded once at process
//! start, mutated in place by the orchestrator, and saved once at exit.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::DbError;

/// Aux key holding the last-fired revision values.
pub const TRIGGERED_REVISIONS_KEY: &str = "triggered_revisions";

/// Aux key prefix for the last closure record, suffixed with the status root.
pub const CLOSED_TREE_KEY_PREFIX: &str = "closed_tree-";

/// State of one build as the gatekeeper last saw it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildDbEntry {
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub succeeded: bool,
    /// Section hash -> unsatisfied step names recorded when it fired.
    #[serde(default)]
    pub triggered: BTreeMap<String, BTreeSet<String>>,
}

/// Build numbers are serialized as strings; BTreeMap keeps output stable.
type BuilderBuilds = BTreeMap<String, BuildDbEntry>;
type MasterMap = BTreeMap<String, BTreeMap<String, BuilderBuilds>>;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BuildDb {
    #[serde(default)]
    masters: MasterMap,
    #[serde(default)]
    pub aux: BTreeMap<String, serde_json::Value>,
}

impl BuildDb {
    /// Load the db from disk; an absent file yields an empty db. Read and
    /// parse errors are fatal: classification must not proceed against a
    /// partially loaded db.
    pub fn load(path: &Path) -> Result<Self, DbError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| DbError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| DbError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the db atomically: serialize to a sibling temp file, then
    /// rename over the target so a crash never leaves a torn file.
    pub fn save(&self, path: &Path) -> Result<(), DbError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| DbError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| DbError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| DbError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get_or_create(&mut self, master: &str, builder: &str, number: u64) -> &mut BuildDbEntry {
        self.masters
            .entry(master.to_string())
            .or_default()
            .entry(builder.to_string())
            .or_default()
            .entry(number.to_string())
            .or_default()
    }

    pub fn get(&self, master: &str, builder: &str, number: u64) -> Option<&BuildDbEntry> {
        self.masters
            .get(master)?
            .get(builder)?
            .get(&number.to_string())
    }

    /// Highest recorded build number for a builder, the scanner's
    /// high-water mark.
    pub fn highest_build(&self, master: &str, builder: &str) -> Option<u64> {
        self.masters
            .get(master)?
            .get(builder)?
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
    }

    /// Iterate every recorded (master, builder, number, entry).
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, u64, &BuildDbEntry)> {
        self.masters.iter().flat_map(|(master, builders)| {
            builders.iter().flat_map(move |(builder, builds)| {
                builds.iter().filter_map(move |(number, entry)| {
                    number
                        .parse::<u64>()
                        .ok()
                        .map(|n| (master.as_str(), builder.as_str(), n, entry))
                })
            })
        })
    }

    /// Record that a finished build succeeded or failed. The finished flag
    /// is sticky: a build once marked finished stays finished.
    pub fn record_result(&mut self, master: &str, builder: &str, number: u64, succeeded: bool) {
        let entry = self.get_or_create(master, builder, number);
        entry.finished = true;
        entry.succeeded = succeeded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_yields_empty_db() {
        let dir = tempdir().unwrap();
        let db = BuildDb::load(&dir.path().join("build_db.json")).unwrap();
        assert_eq!(db.entries().count(), 0);
        assert!(db.aux.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build_db.json");

        let mut db = BuildDb::default();
        let entry = db.get_or_create("http://m", "B", 10);
        entry.finished = true;
        entry.triggered
            .insert("hash".into(), ["compile".to_string()].into());
        db.aux
            .insert("triggered_revisions".into(), serde_json::json!({"revision": 500}));
        db.save(&path).unwrap();

        let loaded = BuildDb::load(&path).unwrap();
        assert_eq!(loaded.get("http://m", "B", 10), db.get("http://m", "B", 10));
        assert_eq!(loaded.aux, db.aux);
        // No stray temp file left behind
        assert!(!dir.path().join("build_db.json.tmp").exists());
    }

    #[test]
    fn get_or_create_defaults_are_unfinished() {
        let mut db = BuildDb::default();
        let entry = db.get_or_create("http://m", "B", 1);
        assert!(!entry.finished);
        assert!(!entry.succeeded);
        assert!(entry.triggered.is_empty());
    }

    #[test]
    fn highest_build_tracks_numeric_maximum() {
        let mut db = BuildDb::default();
        db.get_or_create("http://m", "B", 9);
        db.get_or_create("http://m", "B", 10);
        db.get_or_create("http://m", "B", 2);
        assert_eq!(db.highest_build("http://m", "B"), Some(10));
        assert_eq!(db.highest_build("http://m", "other"), None);
    }

    #[test]
    fn load_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build_db.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            BuildDb::load(&path),
            Err(DbError::ParseFailed { .. })
        ));
    }

    #[test]
    fn record_result_marks_finished() {
        let mut db = BuildDb::default();
        db.record_result("http://m", "B", 5, false);
        let entry = db.get("http://m", "B", 5).unwrap();
        assert!(entry.finished);
        assert!(!entry.succeeded);
    }
}
