//! Tree status control: closing and reopening the commit gate.
//!
//! Decisions are computed as plain values from the live tree state, the
//! build db and the surviving failures; the orchestrator performs the
//! actual HTTP writes. That keeps the open/close rules testable without
//! sockets and keeps all mutation in one place.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::build_db::{BuildDb, CLOSED_TREE_KEY_PREFIX};
use crate::classifier::{BuilderSteps, Failure};
use crate::errors::StatusError;
use crate::model::results;
use crate::template;

/// The tree-status service truncates messages at this many bytes; every
/// message comparison must truncate the same way.
pub const MESSAGE_LIMIT: usize = 499;

/// Live state of the tree as served by the status service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TreeStatus {
    #[serde(default)]
    pub general_state: String,
    #[serde(default)]
    pub message: String,
}

impl TreeStatus {
    pub fn is_open(&self) -> bool {
        self.general_state == "open"
    }

    pub fn is_closed(&self) -> bool {
        self.general_state == "closed"
    }
}

/// Truncate a message to the status service's byte limit on a char boundary.
pub fn truncate_message(message: &str) -> &str {
    if message.len() <= MESSAGE_LIMIT {
        return message;
    }
    let mut end = MESSAGE_LIMIT;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

fn closed_tree_key(status_root: &str) -> String {
    format!("{}{}", CLOSED_TREE_KEY_PREFIX, status_root)
}

/// Order failing builds for template selection: newest start time first,
/// builds with no recorded start time last, then by identity for a stable
/// total order.
pub fn template_build_order(a: &Failure, b: &Failure) -> Ordering {
    let at = a.tuple.build.start_time();
    let bt = b.tuple.build.start_time();
    match (at, bt) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.tuple.master.cmp(&b.tuple.master))
    .then_with(|| a.tuple.builder.cmp(&b.tuple.builder))
    .then_with(|| b.tuple.number.cmp(&a.tuple.number))
}

/// Human-readable result name for templates and mail payloads.
pub fn result_name(code: Option<i64>) -> &'static str {
    match code {
        Some(results::SUCCESS) => "success",
        Some(results::WARNINGS) => "warnings",
        Some(results::EXCEPTION) => "exception",
        Some(results::RETRY) => "retry",
        Some(results::SKIPPED) => "skipped",
        // Unfinished builds report as failures; they reached us by failing.
        _ => "failure",
    }
}

/// Project name shorthand: the last path segment of the master URL.
pub fn project_name(master: &str) -> String {
    master
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(master)
        .to_string()
}

/// URL of a build on its master's waterfall.
pub fn build_url(master: &str, builder: &str, number: u64) -> String {
    format!(
        "{}/builders/{}/builds/{}",
        master.trim_end_matches('/'),
        builder.replace(' ', "%20"),
        number
    )
}

/// Placeholder map for status and subject templates.
pub fn message_context(failure: &Failure, revision_properties: &[String]) -> BTreeMap<String, String> {
    let tuple = &failure.tuple;
    let props = tuple.build.property_map();
    let mut ctx = BTreeMap::new();

    ctx.insert("blamelist".into(), tuple.build.blame.join(", "));
    ctx.insert(
        "build_url".into(),
        build_url(&tuple.master, &tuple.builder, tuple.number),
    );
    ctx.insert("builder_name".into(), tuple.builder.clone());
    ctx.insert("project_name".into(), project_name(&tuple.master));
    ctx.insert(
        "unsatisfied".into(),
        failure
            .unsatisfied
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
    );
    ctx.insert("result".into(), result_name(tuple.build.results).to_string());
    ctx.insert("buildnumber".into(), tuple.number.to_string());

    for name in ["revision", "got_revision"]
        .iter()
        .map(|s| s.to_string())
        .chain(revision_properties.iter().cloned())
    {
        if let Some(value) = props.get(&name) {
            ctx.entry(name).or_insert_with(|| value.to_string());
        }
    }
    ctx
}

/// A decided tree closure, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseAction {
    pub message: String,
}

/// Decide whether to close the tree. Only sections with `close_tree` count;
/// an already-closed (or otherwise non-open) tree is left alone.
pub fn close_decision(
    failures: &[Failure],
    live: &TreeStatus,
    revision_properties: &[String],
) -> Option<CloseAction> {
    let mut closing: Vec<&Failure> = failures.iter().filter(|f| f.section.close_tree).collect();
    if closing.is_empty() {
        return None;
    }
    if !live.is_open() {
        tracing::info!(state = %live.general_state, "tree is not open, leaving it alone");
        return None;
    }
    closing.sort_by(|a, b| template_build_order(a, b));
    let template_failure = closing[0];
    let ctx = message_context(template_failure, revision_properties);
    let message = template::render(&template_failure.section.status_template, &ctx);
    Some(CloseAction {
        message: truncate_message(&message).to_string(),
    })
}

/// Record a closure the gatekeeper issued, for the reopen permission check.
pub fn record_closure(db: &mut BuildDb, status_root: &str, message: &str) {
    db.aux.insert(
        closed_tree_key(status_root),
        serde_json::json!({ "message": truncate_message(message) }),
    );
}

fn stored_closure_message(db: &BuildDb, status_root: &str) -> Option<String> {
    db.aux
        .get(&closed_tree_key(status_root))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Why the tree may not be reopened, for logging.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenVerdict {
    Open,
    BuildsStillFailing,
    OldFailuresUnresolved,
    TreeNotClosed,
    HumanOverride,
}

/// Decide whether the tree may be reopened.
///
/// Reopening requires that the current batch is green, that no recorded
/// failure is still unresolved, that the tree is actually closed, and that
/// the live closure message is the one the gatekeeper wrote. A hand-edited
/// message means a human took over; leave the tree to them. Legacy
/// compatibility: with no stored record, the substring "automatic" in the
/// live message grants permission.
pub fn open_decision(
    db: &BuildDb,
    status_root: &str,
    live: &TreeStatus,
    current_builds_successful: bool,
    successful_builder_steps: &BuilderSteps,
) -> OpenVerdict {
    if !current_builds_successful {
        return OpenVerdict::BuildsStillFailing;
    }

    for (master, builder, _number, entry) in db.entries() {
        if !entry.finished || entry.succeeded {
            continue;
        }
        let resolved = successful_builder_steps
            .get(&(master.to_string(), builder.to_string()))
            .map(|ok| {
                entry
                    .triggered
                    .values()
                    .flatten()
                    .all(|step| ok.contains(step))
            })
            .unwrap_or(entry.triggered.is_empty());
        if !resolved {
            return OpenVerdict::OldFailuresUnresolved;
        }
    }

    if !live.is_closed() {
        return OpenVerdict::TreeNotClosed;
    }

    let permitted = match stored_closure_message(db, status_root) {
        Some(stored) => truncate_message(&stored) == truncate_message(&live.message),
        None => live.message.to_lowercase().contains("automatic"),
    };
    if !permitted {
        return OpenVerdict::HumanOverride;
    }
    OpenVerdict::Open
}

/// Compose the reopen message, decorated with a random emoji when a
/// non-empty list is supplied.
pub fn open_message(emoji: &[String]) -> String {
    match emoji.choose(&mut rand::thread_rng()) {
        Some(e) => format!("Tree is open (Automatic: {})", e),
        None => "Tree is open (Automatic)".to_string(),
    }
}

/// Forget the stored closure record after a successful reopen.
pub fn clear_closure(db: &mut BuildDb, status_root: &str) {
    db.aux.remove(&closed_tree_key(status_root));
}

/// HTTP client for the tree-status service.
pub struct TreeStatusClient {
    client: reqwest::Client,
    root: String,
    username: String,
    password: String,
}

impl TreeStatusClient {
    pub fn new(root: &str, username: &str, password: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            root: root.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Read the live tree state. Some deployments answer unauthenticated
    /// reads with a login page; those get one retry with form-posted
    /// credentials.
    pub async fn fetch(&self) -> Result<TreeStatus, StatusError> {
        let url = format!("{}/current?format=json", self.root);
        let body = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|source| StatusError::Request {
                url: url.clone(),
                source,
            })?
            .text()
            .await
            .map_err(|source| StatusError::Request {
                url: url.clone(),
                source,
            })?;

        if let Ok(status) = serde_json::from_str::<TreeStatus>(&body) {
            return Ok(status);
        }
        if !body.contains("login") {
            return Err(StatusError::Unparseable { url });
        }

        tracing::debug!("tree status read hit a login page, retrying with credentials");
        let body = self
            .client
            .post(&url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|source| StatusError::Request {
                url: url.clone(),
                source,
            })?
            .text()
            .await
            .map_err(|source| StatusError::Request {
                url: url.clone(),
                source,
            })?;
        serde_json::from_str(&body).map_err(|_| StatusError::Unparseable { url })
    }

    /// Write a new tree message.
    pub async fn post_status(&self, message: &str) -> Result<(), StatusError> {
        let url = format!("{}/status", self.root);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("message", message),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|source| StatusError::Request {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(StatusError::Rejected {
                url,
                code: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Section;
    use crate::model::{Build, BuildTuple, SourceStamp};

    fn failure(builder: &str, number: u64, start: Option<f64>, close_tree: bool) -> Failure {
        let mut section = Section::default();
        section.closing_steps.insert("compile".into());
        section.close_tree = close_tree;
        section.status_template = "Build %(builder_name)s failed: %(unsatisfied)s".into();
        section.hash = section.compute_hash();
        Failure {
            tuple: BuildTuple {
                build: Build {
                    builder_name: builder.into(),
                    number,
                    steps: vec![],
                    results: Some(2),
                    properties: vec![],
                    blame: vec!["dev@x.org".into()],
                    source_stamp: SourceStamp::default(),
                    times: vec![start, None],
                    reason: None,
                },
                master: "http://m/chromium".into(),
                builder: builder.into(),
                number,
            },
            section,
            unsatisfied: ["compile".to_string()].into(),
        }
    }

    fn open_tree() -> TreeStatus {
        TreeStatus {
            general_state: "open".into(),
            message: "Tree is open (Automatic)".into(),
        }
    }

    fn closed_tree(message: &str) -> TreeStatus {
        TreeStatus {
            general_state: "closed".into(),
            message: message.into(),
        }
    }

    #[test]
    fn close_renders_template_from_first_failure() {
        let action = close_decision(&[failure("B", 10, Some(5.0), true)], &open_tree(), &[]);
        assert_eq!(
            action,
            Some(CloseAction {
                message: "Build B failed: compile".into()
            })
        );
    }

    #[test]
    fn close_skips_non_closing_sections() {
        assert_eq!(
            close_decision(&[failure("B", 10, Some(5.0), false)], &open_tree(), &[]),
            None
        );
    }

    #[test]
    fn close_never_closes_an_already_closed_tree() {
        assert_eq!(
            close_decision(
                &[failure("B", 10, Some(5.0), true)],
                &closed_tree("closed"),
                &[]
            ),
            None
        );
    }

    #[test]
    fn template_build_is_newest_by_start_time_missing_last() {
        let failures = vec![
            failure("Old", 10, Some(1.0), true),
            failure("NoTime", 12, None, true),
            failure("New", 11, Some(9.0), true),
        ];
        let action = close_decision(&failures, &open_tree(), &[]).unwrap();
        assert_eq!(action.message, "Build New failed: compile");
    }

    #[test]
    fn truncation_respects_limit_and_char_boundaries() {
        let long = "x".repeat(600);
        assert_eq!(truncate_message(&long).len(), MESSAGE_LIMIT);
        let emoji = "☃".repeat(300);
        let t = truncate_message(&emoji);
        assert!(t.len() <= MESSAGE_LIMIT);
        assert!(emoji.starts_with(t));
    }

    #[test]
    fn open_requires_green_batch() {
        let db = BuildDb::default();
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Tree is closed (Automatic)"),
                false,
                &BuilderSteps::new()
            ),
            OpenVerdict::BuildsStillFailing
        );
    }

    #[test]
    fn open_requires_closed_tree() {
        let db = BuildDb::default();
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &open_tree(),
                true,
                &BuilderSteps::new()
            ),
            OpenVerdict::TreeNotClosed
        );
    }

    #[test]
    fn open_blocked_by_unresolved_recorded_failure() {
        let mut db = BuildDb::default();
        let entry = db.get_or_create("http://m", "B", 10);
        entry.finished = true;
        entry.succeeded = false;
        entry
            .triggered
            .insert("hash".into(), ["compile".to_string()].into());
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Tree is closed (Automatic)"),
                true,
                &BuilderSteps::new()
            ),
            OpenVerdict::OldFailuresUnresolved
        );

        // A newer build that ran compile successfully resolves it.
        let mut steps = BuilderSteps::new();
        steps.insert(
            ("http://m".into(), "B".into()),
            ["compile".to_string()].into(),
        );
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Tree is closed (Automatic)"),
                true,
                &steps
            ),
            OpenVerdict::Open
        );
    }

    #[test]
    fn open_permitted_only_for_own_closure_message() {
        let mut db = BuildDb::default();
        record_closure(&mut db, "http://tree", "Build B failed: compile");
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Build B failed: compile"),
                true,
                &BuilderSteps::new()
            ),
            OpenVerdict::Open
        );
        // Human edited the message: hands off.
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Out for lunch"),
                true,
                &BuilderSteps::new()
            ),
            OpenVerdict::HumanOverride
        );
    }

    #[test]
    fn legacy_automatic_substring_grants_permission() {
        let db = BuildDb::default();
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Tree is closed (AUTOMATIC: compile)"),
                true,
                &BuilderSteps::new()
            ),
            OpenVerdict::Open
        );
        assert_eq!(
            open_decision(
                &db,
                "http://tree",
                &closed_tree("Out for lunch"),
                true,
                &BuilderSteps::new()
            ),
            OpenVerdict::HumanOverride
        );
    }

    #[test]
    fn clear_closure_removes_record() {
        let mut db = BuildDb::default();
        record_closure(&mut db, "http://tree", "msg");
        clear_closure(&mut db, "http://tree");
        assert!(db.aux.is_empty());
    }

    #[test]
    fn open_message_with_and_without_emoji() {
        assert_eq!(open_message(&[]), "Tree is open (Automatic)");
        let m = open_message(&["☀".to_string()]);
        assert_eq!(m, "Tree is open (Automatic: ☀)");
    }

    #[test]
    fn message_context_carries_placeholders() {
        let ctx = message_context(&failure("B", 10, Some(5.0), true), &[]);
        assert_eq!(ctx["builder_name"], "B");
        assert_eq!(ctx["unsatisfied"], "compile");
        assert_eq!(ctx["blamelist"], "dev@x.org");
        assert_eq!(ctx["buildnumber"], "10");
        assert_eq!(ctx["project_name"], "chromium");
        assert_eq!(ctx["result"], "failure");
        assert_eq!(ctx["build_url"], "http://m/chromium/builders/B/builds/10");
    }
}
