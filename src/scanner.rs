//! Build scanning: fetch builds that are new since the last run.
//!
//! Each master serves a builder summary at `/json/builders` and individual
//! builds at `/json/builders/<builder>/builds/<number>`. The scanner pulls
//! everything above the build db's high-water mark per builder, with a
//! bounded number of requests in flight. One broken master never aborts the
//! scan of the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::build_db::BuildDb;
use crate::errors::FetchError;
use crate::model::{Build, BuildTuple};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Build numbers worth fetching given the master's cached list and the db
/// high-water mark. A builder we have never seen contributes only its most
/// recent build, so a fresh db does not replay the whole waterfall.
pub fn new_build_numbers(cached: &[u64], high_water: Option<u64>) -> Vec<u64> {
    match high_water {
        Some(mark) => cached.iter().copied().filter(|n| *n > mark).collect(),
        None => cached.iter().copied().max().into_iter().collect(),
    }
}

/// Extract builder name -> cached build numbers from a master summary.
pub fn builder_build_numbers(summary: &serde_json::Value) -> BTreeMap<String, Vec<u64>> {
    let mut out = BTreeMap::new();
    let Some(builders) = summary.as_object() else {
        return out;
    };
    for (name, info) in builders {
        let cached = info
            .get("cachedBuilds")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|n| n.as_u64()).collect())
            .unwrap_or_default();
        out.insert(name.clone(), cached);
    }
    out
}

pub struct BuildScanner {
    client: reqwest::Client,
    parallelism: usize,
}

impl BuildScanner {
    pub fn new(parallelism: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            parallelism: parallelism.max(1),
        }
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        self.client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?
            .error_for_status()
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?
            .json()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })
    }

    /// Fetch new builds from every master. Returns the master summaries and
    /// the build tuples sorted by build number descending, so the freshest
    /// state on each builder is observed first.
    pub async fn scan(
        &self,
        masters: &[String],
        db: &BuildDb,
    ) -> (BTreeMap<String, serde_json::Value>, Vec<BuildTuple>) {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut master_jsons = BTreeMap::new();
        let mut wanted: Vec<(String, String, u64)> = Vec::new();

        for master in masters {
            let url = format!("{}/json/builders", master.trim_end_matches('/'));
            let summary = {
                let Ok(_permit) = semaphore.acquire().await else {
                    break;
                };
                self.fetch_json(&url).await
            };
            let summary = match summary {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(master = %master, error = %err, "master fetch failed, skipping");
                    continue;
                }
            };
            for (builder, cached) in builder_build_numbers(&summary) {
                let mark = db.highest_build(master, &builder);
                for number in new_build_numbers(&cached, mark) {
                    wanted.push((master.clone(), builder.clone(), number));
                }
            }
            master_jsons.insert(master.clone(), summary);
        }

        let mut handles = Vec::new();
        for (master, builder, number) in wanted {
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let url = format!(
                "{}/json/builders/{}/builds/{}",
                master.trim_end_matches('/'),
                builder.replace(' ', "%20"),
                number
            );
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                let result = client
                    .get(&url)
                    .timeout(FETCH_TIMEOUT)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                let build: Option<Build> = match result {
                    Ok(response) => response.json().await.ok(),
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "build fetch failed");
                        None
                    }
                };
                build.map(|build| BuildTuple {
                    build,
                    master,
                    builder,
                    number,
                })
            }));
        }

        let mut build_tuples: Vec<BuildTuple> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok().flatten())
            .collect();
        build_tuples.sort_by(|a, b| b.number.cmp(&a.number));
        (master_jsons, build_tuples)
    }
}
