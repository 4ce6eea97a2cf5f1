//! Failure notification: resolve watchers, sign, and mail.
//!
//! Watchers are the section's `tree_notify` list, the blamelist (unless the
//! failure is confined to forgiving steps) and the on-call sheriffs.
//! Payloads with identical content are sent once with the recipient sets
//! merged. Requests to the mailer are HMAC-SHA256 signed over the body, the
//! signing-time UTC epoch seconds and a random salt.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Serialize;
use sha2::Sha256;

use crate::classifier::Failure;
use crate::errors::{FetchError, MailError};
use crate::tree::{build_url, project_name, result_name};

type HmacSha256 = Hmac<Sha256>;

const SHERIFF_RETRIES: u32 = 5;
const SHERIFF_TIMEOUT: Duration = Duration::from_secs(60);
const SHERIFF_DEFAULT_DOMAIN: &str = "google.com";

/// Addressing and signing configuration for outgoing mail.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub url: String,
    pub secret: String,
    pub from_addr: String,
    pub default_email_domain: String,
    /// `None` disables domain filtering.
    pub filter_domains: Option<BTreeSet<String>>,
}

/// Append the default domain to bare usernames and apply the domain filter.
pub fn normalize_watchers(
    watchers: BTreeSet<String>,
    default_domain: &str,
    filter_domains: Option<&BTreeSet<String>>,
) -> BTreeSet<String> {
    watchers
        .into_iter()
        .map(|w| {
            if w.contains('@') {
                w
            } else {
                format!("{}@{}", w, default_domain)
            }
        })
        .filter(|addr| match filter_domains {
            Some(domains) => addr
                .rsplit('@')
                .next()
                .is_some_and(|domain| domains.contains(domain)),
            None => true,
        })
        .collect()
}

/// Recipient set for one failure, before domain normalization.
///
/// The blamelist is only pulled in when the failure reaches beyond the
/// section's forgiving steps; forgiving failures notify the tree watchers
/// and sheriffs without paging committers.
pub fn resolve_watchers(failure: &Failure, sheriffs: &BTreeSet<String>) -> BTreeSet<String> {
    let mut watchers: BTreeSet<String> = failure.section.tree_notify.clone();
    let forgiving = failure
        .section
        .forgiving_effective(&failure.tuple.build.finished_steps());
    if !failure.unsatisfied.iter().all(|s| forgiving.contains(s)) {
        watchers.extend(failure.tuple.build.blame.iter().cloned());
    }
    watchers.extend(sheriffs.iter().cloned());
    watchers
}

#[derive(Debug, Clone, Serialize)]
struct PayloadStep {
    name: String,
    text: Vec<String>,
    logs: Vec<serde_json::Value>,
    urls: serde_json::Value,
    started: bool,
    results: Option<i64>,
}

/// Mail content for one failure, minus the recipient list. Two failures
/// with identical payloads are mailed once.
#[derive(Debug, Clone, Serialize)]
pub struct MailPayload {
    build_url: String,
    from_addr: String,
    project_name: String,
    subject_template: String,
    waterfall_url: String,
    steps: Vec<PayloadStep>,
    unsatisfied: Vec<String>,
    #[serde(rename = "builderName")]
    builder_name: String,
    number: u64,
    reason: Option<String>,
    result: String,
    blamelist: Vec<String>,
    changes: Vec<serde_json::Value>,
    revisions: Vec<String>,
}

/// Build the mail payload for one failure.
pub fn build_payload(failure: &Failure, config: &MailerConfig) -> MailPayload {
    let tuple = &failure.tuple;
    let build = &tuple.build;
    MailPayload {
        build_url: build_url(&tuple.master, &tuple.builder, tuple.number),
        from_addr: config.from_addr.clone(),
        project_name: project_name(&tuple.master),
        subject_template: failure.section.subject_template.clone(),
        waterfall_url: tuple.master.clone(),
        steps: build
            .steps
            .iter()
            .map(|s| PayloadStep {
                name: s.name.clone(),
                text: s.text.clone(),
                logs: s.logs.clone(),
                urls: s.urls.clone(),
                started: s.times.first().copied().flatten().is_some(),
                results: s.results,
            })
            .collect(),
        unsatisfied: failure.unsatisfied.iter().cloned().collect(),
        builder_name: tuple.builder.clone(),
        number: tuple.number,
        reason: build.reason.clone(),
        result: result_name(build.results).to_string(),
        blamelist: build.blame.clone(),
        changes: build
            .source_stamp
            .changes
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect(),
        revisions: build
            .source_stamp
            .changes
            .iter()
            .filter_map(|c| c.revision.as_ref())
            .map(|r| r.as_str().map(String::from).unwrap_or_else(|| r.to_string()))
            .collect(),
    }
}

/// Group (payload, recipients) pairs by payload content, unioning the
/// recipient sets. Empty recipient sets produce no mail.
pub fn group_payloads(
    items: Vec<(MailPayload, BTreeSet<String>)>,
) -> Vec<(MailPayload, BTreeSet<String>)> {
    let mut grouped: BTreeMap<String, (MailPayload, BTreeSet<String>)> = BTreeMap::new();
    for (payload, recipients) in items {
        if recipients.is_empty() {
            continue;
        }
        let key = serde_json::to_string(&payload).unwrap_or_default();
        grouped
            .entry(key)
            .and_modify(|(_, r)| r.extend(recipients.iter().cloned()))
            .or_insert((payload, recipients));
    }
    grouped.into_values().collect()
}

/// The signed envelope posted to the mailer as the `json` form field.
#[derive(Debug, Serialize)]
pub struct SignedRequest {
    pub message: String,
    pub time: i64,
    pub salt: u32,
    pub url: String,
    #[serde(rename = "hmac-sha256")]
    pub hmac_sha256: String,
}

/// Sign a message body for the mailer: HMAC over body || time || salt.
pub fn sign_request(secret: &str, message: String, url: &str, time: i64, salt: u32) -> SignedRequest {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    mac.update(time.to_string().as_bytes());
    mac.update(salt.to_string().as_bytes());
    SignedRequest {
        message,
        time,
        salt,
        url: url.to_string(),
        hmac_sha256: hex::encode(mac.finalize().into_bytes()),
    }
}

pub struct Notifier {
    client: reqwest::Client,
    config: MailerConfig,
}

impl Notifier {
    pub fn new(config: MailerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &MailerConfig {
        &self.config
    }

    /// Mail every grouped payload. A rejected payload is logged and does not
    /// block the rest of the batch.
    pub async fn send_all(&self, groups: Vec<(MailPayload, BTreeSet<String>)>) {
        for (payload, recipients) in groups {
            if let Err(err) = self.send_one(&payload, &recipients).await {
                tracing::error!(error = %err, "mail delivery failed");
            }
        }
    }

    async fn send_one(
        &self,
        payload: &MailPayload,
        recipients: &BTreeSet<String>,
    ) -> Result<(), MailError> {
        let mut body = serde_json::to_value(payload).unwrap_or_default();
        body["recipients"] =
            serde_json::Value::from(recipients.iter().cloned().collect::<Vec<_>>());
        let message = body.to_string();

        // The mailer rejects stale timestamps; read the clock at signing
        // time, not process start.
        let signed = sign_request(
            &self.config.secret,
            message,
            &self.config.url,
            chrono::Utc::now().timestamp(),
            rand::random::<u32>(),
        );
        let json = serde_json::to_string(&signed).unwrap_or_default();

        let response = self
            .client
            .post(&self.config.url)
            .form(&[("json", json.as_str())])
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|source| MailError::Request {
                url: self.config.url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(MailError::Rejected {
                url: self.config.url.clone(),
                code: response.status().as_u16(),
            });
        }
        tracing::info!(recipients = recipients.len(), "notification sent");
        Ok(())
    }
}

/// Parse a sheriff roster body of the form `document.write('a, b, c')`.
pub fn parse_sheriff_body(body: &str) -> BTreeSet<String> {
    let re = Regex::new(r"document\.write\('([^']*)'\)").expect("static regex");
    let Some(caps) = re.captures(body) else {
        return BTreeSet::new();
    };
    caps[1]
        .split(", ")
        .filter(|s| !s.is_empty() && *s != "None")
        .map(|s| {
            if s.contains('@') {
                s.to_string()
            } else {
                format!("{}@{}", s, SHERIFF_DEFAULT_DOMAIN)
            }
        })
        .collect()
}

/// Union of on-call sheriffs across the section's classes. Each class is
/// fetched with bounded retries and exponential backoff; a class that never
/// answers contributes nothing.
pub async fn fetch_sheriffs(
    client: &reqwest::Client,
    url_pattern: &str,
    classes: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut sheriffs = BTreeSet::new();
    for class in classes {
        let url = url_pattern.replace("%s", class);
        match fetch_with_retries(client, &url).await {
            Ok(body) => sheriffs.extend(parse_sheriff_body(&body)),
            Err(err) => {
                tracing::warn!(class = %class, error = %err, "sheriff lookup failed");
            }
        }
    }
    sheriffs
}

async fn fetch_with_retries(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let mut delay = Duration::from_secs(1);
    let mut last_err = None;
    for attempt in 0..SHERIFF_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        let result = client
            .get(url)
            .timeout(SHERIFF_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(response) => {
                return response.text().await.map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                });
            }
            Err(source) => {
                last_err = Some(FetchError::Request {
                    url: url.to_string(),
                    source,
                });
            }
        }
    }
    Err(last_err.unwrap_or(FetchError::BadResponse {
        url: url.to_string(),
        message: "no attempts made".into(),
    }))
}
