//! Pipeline driver.
//!
//! Owns the build db for the whole run: every stage returns values and the
//! orchestrator applies them, so there is exactly one mutation site. The db
//! is saved on the way out unless the run was a sync, a simulation, or
//! explicitly told not to.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::build_db::BuildDb;
use crate::classifier::{self, Classification};
use crate::config::GatekeeperConfig;
use crate::debounce::debounce;
use crate::errors::ConfigError;
use crate::model::{Build, BuildTuple, Step, results};
use crate::notifier::{
    self, MailerConfig, Notifier, build_payload, group_payloads, normalize_watchers,
    resolve_watchers,
};
use crate::revisions::RevisionFilter;
use crate::scanner::BuildScanner;
use crate::tree::{self, OpenVerdict, TreeStatusClient};

/// A synthetic failing build injected instead of a network scan, used for
/// notification drills.
#[derive(Debug, Clone)]
pub struct SimulatedFailure {
    pub master: String,
    pub builder: String,
    pub steps: Vec<String>,
}

/// Everything the pipeline needs, assembled once from the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub masters: Vec<String>,
    pub config_path: PathBuf,
    pub build_db_path: PathBuf,
    pub clear_build_db: bool,
    pub sync_build_db: bool,
    pub skip_build_db_update: bool,
    pub set_status: bool,
    pub open_tree: bool,
    pub status_url: Option<String>,
    pub status_user: String,
    pub password: String,
    pub track_revisions: bool,
    pub revision_properties: Vec<String>,
    pub sheriff_url: Option<String>,
    pub from_addr: String,
    pub email_domain: String,
    pub filter_domains: Option<BTreeSet<String>>,
    pub email_app_url: Option<String>,
    pub email_app_secret: Option<String>,
    pub parallelism: usize,
    pub emoji: Vec<String>,
    pub simulate: Option<SimulatedFailure>,
}

/// Run the full gatekeeper pipeline once.
pub async fn run(options: RunOptions) -> Result<()> {
    let mut config = GatekeeperConfig::load(&options.config_path)?;
    config.inject_hashes();

    for master in &options.masters {
        if config.sections_for(master).is_empty() {
            return Err(ConfigError::UnknownMaster(master.clone()).into());
        }
    }

    let mut db = if options.clear_build_db {
        let empty = BuildDb::default();
        empty.save(&options.build_db_path)?;
        empty
    } else {
        BuildDb::load(&options.build_db_path)?
    };

    let build_tuples = match &options.simulate {
        Some(sim) => simulate_scan(sim, &db),
        None => {
            let scanner = BuildScanner::new(options.parallelism);
            let (_master_jsons, tuples) = scanner.scan(&options.masters, &db).await;
            tuples
        }
    };
    tracing::info!(builds = build_tuples.len(), "scan complete");

    if options.sync_build_db {
        for tuple in &build_tuples {
            db.get_or_create(&tuple.master, &tuple.builder, tuple.number);
        }
        db.save(&options.build_db_path)?;
        return Ok(());
    }

    let classification = classifier::classify(&config, &build_tuples);
    propagate_results(&mut db, &classification, &build_tuples);

    let status_client = options.status_url.as_ref().map(|url| {
        TreeStatusClient::new(url, &options.status_user, &options.password)
    });

    if options.open_tree {
        if let Some(client) = &status_client {
            maybe_open_tree(client, &mut db, &classification, &options.emoji).await;
        }
    }

    let mut failures = classification.failures.clone();
    if options.track_revisions {
        let filter = RevisionFilter::new(options.revision_properties.clone());
        failures = filter.filter(&mut db.aux, failures);
    }
    let failures = debounce(&mut db, failures, classification.current_builds_successful);
    tracing::info!(failures = failures.len(), "failures after debounce");

    if options.set_status {
        if let Some(client) = &status_client {
            maybe_close_tree(client, &mut db, &failures, &options.revision_properties).await;
        }
    }

    if let (Some(url), Some(secret)) = (&options.email_app_url, &options.email_app_secret) {
        let mailer = MailerConfig {
            url: url.clone(),
            secret: secret.clone(),
            from_addr: options.from_addr.clone(),
            default_email_domain: options.email_domain.clone(),
            filter_domains: options.filter_domains.clone(),
        };
        notify(&options, mailer, &failures).await;
    }

    if !options.skip_build_db_update && options.simulate.is_none() {
        db.save(&options.build_db_path)?;
    }
    Ok(())
}

/// Mark finished builds in the db. Unfinished builds may sit in failure
/// analysis but are not recorded until they finish.
fn propagate_results(
    db: &mut BuildDb,
    classification: &Classification,
    build_tuples: &[BuildTuple],
) {
    let succeeded: BTreeSet<String> = classification
        .succeeded
        .iter()
        .map(|t| t.key().to_string())
        .collect();
    for tuple in build_tuples {
        if tuple.build.is_finished() {
            let ok = succeeded.contains(&tuple.key().to_string());
            db.record_result(&tuple.master, &tuple.builder, tuple.number, ok);
        }
    }
}

async fn maybe_open_tree(
    client: &TreeStatusClient,
    db: &mut BuildDb,
    classification: &Classification,
    emoji: &[String],
) {
    let live = match client.fetch().await {
        Ok(live) => live,
        Err(err) => {
            tracing::warn!(error = %err, "could not read tree status, skipping open");
            return;
        }
    };
    let verdict = tree::open_decision(
        db,
        client.root(),
        &live,
        classification.current_builds_successful,
        &classification.successful_builder_steps,
    );
    if verdict != OpenVerdict::Open {
        tracing::info!(?verdict, "not reopening tree");
        return;
    }
    let message = tree::open_message(emoji);
    match client.post_status(&message).await {
        Ok(()) => {
            tracing::info!(message = %message, "tree reopened");
            tree::clear_closure(db, client.root());
        }
        Err(err) => tracing::error!(error = %err, "tree reopen write failed"),
    }
}

async fn maybe_close_tree(
    client: &TreeStatusClient,
    db: &mut BuildDb,
    failures: &[classifier::Failure],
    revision_properties: &[String],
) {
    if failures.is_empty() {
        return;
    }
    let live = match client.fetch().await {
        Ok(live) => live,
        Err(err) => {
            tracing::warn!(error = %err, "could not read tree status, skipping close");
            return;
        }
    };
    let Some(action) = tree::close_decision(failures, &live, revision_properties) else {
        return;
    };
    match client.post_status(&action.message).await {
        Ok(()) => {
            tracing::info!(message = %action.message, "tree closed");
            tree::record_closure(db, client.root(), &action.message);
        }
        Err(err) => tracing::error!(error = %err, "tree close write failed"),
    }
}

async fn notify(options: &RunOptions, mailer: MailerConfig, failures: &[classifier::Failure]) {
    let client = reqwest::Client::new();
    let mut items = Vec::new();
    for failure in failures {
        let sheriffs = match &options.sheriff_url {
            Some(pattern) => {
                notifier::fetch_sheriffs(&client, pattern, &failure.section.sheriff_classes).await
            }
            None => BTreeSet::new(),
        };
        let watchers = normalize_watchers(
            resolve_watchers(failure, &sheriffs),
            &mailer.default_email_domain,
            mailer.filter_domains.as_ref(),
        );
        items.push((build_payload(failure, &mailer), watchers));
    }
    let groups = group_payloads(items);
    Notifier::new(mailer).send_all(groups).await;
}

fn simulate_scan(sim: &SimulatedFailure, db: &BuildDb) -> Vec<BuildTuple> {
    let number = db.highest_build(&sim.master, &sim.builder).map_or(1, |n| n + 1);
    let steps = sim
        .steps
        .iter()
        .map(|name| Step {
            name: name.clone(),
            is_finished: true,
            results: Some(results::FAILURE),
            text: vec![],
            logs: vec![],
            urls: serde_json::Value::Null,
            times: vec![Some(0.0), Some(1.0)],
        })
        .collect();
    let build = Build {
        builder_name: sim.builder.clone(),
        number,
        steps,
        results: Some(results::FAILURE),
        properties: vec![],
        blame: vec![],
        source_stamp: Default::default(),
        times: vec![Some(0.0), Some(1.0)],
        reason: Some("simulation".into()),
    };
    tracing::info!(master = %sim.master, builder = %sim.builder, number, "simulating failure");
    vec![BuildTuple {
        build,
        master: sim.master.clone(),
        builder: sim.builder.clone(),
        number,
    }]
}

/// Read an emoji list: one emoji per line, blank lines and `#` comments
/// skipped. The literal value "None" disables decoration.
pub fn load_emoji(path: Option<&str>) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    if path == "None" {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read emoji file {}", path))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_scan_builds_a_failing_build() {
        let sim = SimulatedFailure {
            master: "http://m".into(),
            builder: "B".into(),
            steps: vec!["compile".into(), "test".into()],
        };
        let db = BuildDb::default();
        let tuples = simulate_scan(&sim, &db);
        assert_eq!(tuples.len(), 1);
        let build = &tuples[0].build;
        assert_eq!(build.number, 1);
        assert!(build.is_finished());
        assert_eq!(build.finished_steps().len(), 2);
        assert!(build.successful_steps().is_empty());
    }

    #[test]
    fn simulate_scan_numbers_above_high_water_mark() {
        let sim = SimulatedFailure {
            master: "http://m".into(),
            builder: "B".into(),
            steps: vec!["compile".into()],
        };
        let mut db = BuildDb::default();
        db.get_or_create("http://m", "B", 41);
        assert_eq!(simulate_scan(&sim, &db)[0].number, 42);
    }

    #[test]
    fn propagate_marks_only_finished_builds() {
        let mut section = crate::config::Section::default();
        section.closing_steps.insert("compile".into());
        let mut config = GatekeeperConfig::default();
        config.masters.insert("http://m".into(), vec![section]);
        config.inject_hashes();

        let finished_ok: BuildTuple = BuildTuple {
            build: serde_json::from_value(serde_json::json!({
                "builderName": "B", "number": 11, "results": 0,
                "steps": [{"name": "compile", "isFinished": true, "results": 0}]
            }))
            .unwrap(),
            master: "http://m".into(),
            builder: "B".into(),
            number: 11,
        };
        let running: BuildTuple = BuildTuple {
            build: serde_json::from_value(serde_json::json!({
                "builderName": "B", "number": 12
            }))
            .unwrap(),
            master: "http://m".into(),
            builder: "B".into(),
            number: 12,
        };
        let tuples = vec![running.clone(), finished_ok.clone()];
        let classification = classifier::classify(&config, &tuples);

        let mut db = BuildDb::default();
        propagate_results(&mut db, &classification, &tuples);
        assert!(db.get("http://m", "B", 11).unwrap().finished);
        assert!(db.get("http://m", "B", 11).unwrap().succeeded);
        assert!(db.get("http://m", "B", 12).is_none());
    }

    #[test]
    fn load_emoji_handles_none_and_comments() {
        assert!(load_emoji(None).unwrap().is_empty());
        assert!(load_emoji(Some("None")).unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emoji.txt");
        std::fs::write(&path, "# happy trees\n☀\n\n☃\n").unwrap();
        let emoji = load_emoji(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(emoji, vec!["☀".to_string(), "☃".to_string()]);
    }
}
