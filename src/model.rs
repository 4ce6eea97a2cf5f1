//! Build and step wire model.
//!
//! Mirrors the JSON the build master's JSON interface serves, keeping only
//! the fields the gatekeeper cares about. Parsing is deliberately lenient: a
//! build missing expected fields is treated as unfinished with empty steps
//! rather than failing the whole scan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::properties::PropValue;

/// Build/step result codes used by the master.
pub mod results {
    pub const SUCCESS: i64 = 0;
    pub const WARNINGS: i64 = 1;
    pub const FAILURE: i64 = 2;
    pub const SKIPPED: i64 = 3;
    pub const EXCEPTION: i64 = 4;
    pub const RETRY: i64 = 5;
}

/// True when a result code counts as a failure. Exception and retry are
/// infrastructure noise, not build failures.
pub fn is_failure(code: i64) -> bool {
    code == results::FAILURE
}

/// One step inside a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "isFinished", default)]
    pub is_finished: bool,
    /// Result code; absent while the step is running. The master serves
    /// either a bare integer or a `[code, text]` pair.
    #[serde(default, deserialize_with = "result_code_lenient")]
    pub results: Option<i64>,
    #[serde(default)]
    pub text: Vec<String>,
    #[serde(default)]
    pub logs: Vec<serde_json::Value>,
    #[serde(default)]
    pub urls: serde_json::Value,
    #[serde(default)]
    pub times: Vec<Option<f64>>,
}

impl Step {
    pub fn result_code(&self) -> i64 {
        self.results.unwrap_or(results::SUCCESS)
    }
}

fn result_code_lenient<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::Array(items) => items.first().and_then(|v| v.as_i64()),
        _ => None,
    })
}

/// A source change implicated in a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub revision: Option<serde_json::Value>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub when: Option<f64>,
}

/// One numbered build on a builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    #[serde(rename = "builderName", default)]
    pub builder_name: String,
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Overall result; set once the build finishes.
    #[serde(default)]
    pub results: Option<i64>,
    /// Property triples [name, value, source] as the master serves them.
    #[serde(default)]
    pub properties: Vec<serde_json::Value>,
    #[serde(default)]
    pub blame: Vec<String>,
    #[serde(rename = "sourceStamp", default)]
    pub source_stamp: SourceStamp,
    /// [start, end]; end is null while running.
    #[serde(default)]
    pub times: Vec<Option<f64>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStamp {
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl Build {
    /// A build is finished once it carries an overall result.
    pub fn is_finished(&self) -> bool {
        self.results.is_some()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.times.first().copied().flatten()
    }

    /// Names of steps that have finished.
    pub fn finished_steps(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter(|s| s.is_finished)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Names of finished steps whose result is not a failure.
    pub fn successful_steps(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter(|s| s.is_finished && !is_failure(s.result_code()))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Flatten the master's [name, value, source] property triples into a map.
    pub fn property_map(&self) -> BTreeMap<String, PropValue> {
        let mut map = BTreeMap::new();
        for triple in &self.properties {
            if let Some(arr) = triple.as_array() {
                if let Some(name) = arr.first().and_then(|v| v.as_str()) {
                    let value = arr.get(1).map(PropValue::from_json).unwrap_or(PropValue::Null);
                    map.insert(name.to_string(), value);
                }
            }
        }
        map
    }

    pub fn property(&self, name: &str) -> Option<PropValue> {
        self.property_map().remove(name)
    }
}

/// Identifies one build on one master for keying and logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub master: String,
    pub builder: String,
    pub number: u64,
}

impl std::fmt::Display for BuildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.master, self.builder, self.number)
    }
}

/// A fetched build paired with where it came from.
#[derive(Debug, Clone)]
pub struct BuildTuple {
    pub build: Build,
    pub master: String,
    pub builder: String,
    pub number: u64,
}

impl BuildTuple {
    pub fn key(&self) -> BuildKey {
        BuildKey {
            master: self.master.clone(),
            builder: self.builder.clone(),
            number: self.number,
        }
    }
}
