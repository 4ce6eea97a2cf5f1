use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, normalize_master_url};
use gatekeeper::errors::ConfigError;
use gatekeeper::orchestrator::{self, RunOptions, SimulatedFailure};

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(version, about = "Watches build waterfalls and gates the commit tree")]
pub struct Cli {
    /// Master URLs to watch
    #[arg(value_name = "MASTER_URL", required_unless_present_any = ["verify", "flatten_json"])]
    pub masters: Vec<String>,

    /// Gatekeeper config file
    #[arg(long, default_value = "gatekeeper.json")]
    pub json: PathBuf,

    /// Build db file
    #[arg(long, default_value = "build_db.json")]
    pub build_db: PathBuf,

    /// Write an empty build db before the run
    #[arg(long)]
    pub clear_build_db: bool,

    /// Scan only; record high-water marks without classifying
    #[arg(long)]
    pub sync_build_db: bool,

    /// Do not save the build db at the end of the run
    #[arg(long)]
    pub skip_build_db_update: bool,

    /// Allow closing the tree
    #[arg(long)]
    pub set_status: bool,

    /// Allow reopening the tree
    #[arg(long)]
    pub open_tree: bool,

    /// Tree-status service root URL
    #[arg(long)]
    pub status_url: Option<String>,

    /// Account used for tree-status writes
    #[arg(long, default_value = "gatekeeper")]
    pub status_user: String,

    /// File holding the tree-status password
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Enable revision tracking (fire at most once per revision set)
    #[arg(long)]
    pub track_revisions: bool,

    /// Comma-separated build properties to track as revisions
    #[arg(long, default_value = "revision")]
    pub revision_properties: String,

    /// Sheriff roster URL pattern; %s is replaced with the class name
    #[arg(long)]
    pub sheriff_url: Option<String>,

    /// From address for notification mail
    #[arg(long, default_value = "buildbot@chromium.org")]
    pub default_from_email: String,

    /// Domain appended to bare usernames
    #[arg(long, default_value = "chromium.org")]
    pub email_domain: String,

    /// Comma-separated domains allowed to receive mail
    #[arg(long, default_value = "chromium.org,google.com")]
    pub filter_domain: String,

    /// Mail every resolved watcher regardless of domain
    #[arg(long)]
    pub disable_domain_filter: bool,

    /// Mailer endpoint URL
    #[arg(long)]
    pub email_app_url: Option<String>,

    /// File holding the mailer HMAC secret
    #[arg(long)]
    pub email_app_secret_file: Option<PathBuf>,

    /// Do not send any mail
    #[arg(long)]
    pub no_email_app: bool,

    /// Emoji list file for reopen messages, or the literal "None"
    #[arg(long)]
    pub emoji: Option<String>,

    /// Maximum concurrent master/build fetches
    #[arg(long, default_value = "8")]
    pub parallelism: usize,

    /// Validate the config and exit
    #[arg(long)]
    pub verify: bool,

    /// Print the expanded config with section hashes and exit
    #[arg(long)]
    pub flatten_json: bool,

    /// Omit section hashes from --flatten-json output
    #[arg(long)]
    pub no_hashes: bool,

    #[arg(short, long)]
    pub verbose: bool,

    /// Master for a simulated failure (skips the network scan)
    #[arg(long)]
    pub simulate_master: Option<String>,

    /// Builder for a simulated failure
    #[arg(long)]
    pub simulate_builder: Option<String>,

    /// Failing step for a simulated failure (repeatable)
    #[arg(long)]
    pub simulate_step: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn read_secret(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read secret file {}", path.display()))?;
    Ok(content.trim().to_string())
}

fn csv_set(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn build_options(cli: &Cli) -> Result<RunOptions> {
    let password = match &cli.password_file {
        Some(path) => read_secret(path)?,
        None => String::new(),
    };
    if (cli.set_status || cli.open_tree) && cli.status_url.is_some() && password.is_empty() {
        return Err(ConfigError::Usage(
            "--set-status/--open-tree with --status-url requires --password-file".into(),
        )
        .into());
    }

    let email_app_secret = match (&cli.email_app_url, cli.no_email_app) {
        (Some(_), false) => {
            let path = cli.email_app_secret_file.as_ref().ok_or_else(|| {
                ConfigError::Usage("--email-app-url requires --email-app-secret-file".into())
            })?;
            Some(read_secret(path)?)
        }
        _ => None,
    };

    let simulate = match (&cli.simulate_master, &cli.simulate_builder) {
        (Some(master), Some(builder)) => {
            if cli.simulate_step.is_empty() {
                return Err(ConfigError::Usage(
                    "simulation requires at least one --simulate-step".into(),
                )
                .into());
            }
            Some(SimulatedFailure {
                master: normalize_master_url(master),
                builder: builder.clone(),
                steps: cli.simulate_step.clone(),
            })
        }
        (None, None) => None,
        _ => {
            return Err(ConfigError::Usage(
                "--simulate-master and --simulate-builder must be given together".into(),
            )
            .into());
        }
    };

    Ok(RunOptions {
        masters: cli.masters.iter().map(|m| normalize_master_url(m)).collect(),
        config_path: cli.json.clone(),
        build_db_path: cli.build_db.clone(),
        clear_build_db: cli.clear_build_db,
        sync_build_db: cli.sync_build_db,
        skip_build_db_update: cli.skip_build_db_update,
        set_status: cli.set_status,
        open_tree: cli.open_tree,
        status_url: cli.status_url.clone(),
        status_user: cli.status_user.clone(),
        password,
        track_revisions: cli.track_revisions,
        revision_properties: csv_set(&cli.revision_properties).into_iter().collect(),
        sheriff_url: cli.sheriff_url.clone(),
        from_addr: cli.default_from_email.clone(),
        email_domain: cli.email_domain.clone(),
        filter_domains: if cli.disable_domain_filter {
            None
        } else {
            Some(csv_set(&cli.filter_domain))
        },
        email_app_url: if cli.no_email_app {
            None
        } else {
            cli.email_app_url.clone()
        },
        email_app_secret,
        parallelism: cli.parallelism,
        emoji: orchestrator::load_emoji(cli.emoji.as_deref())?,
        simulate,
    })
}

async fn run(cli: Cli) -> Result<()> {
    if cli.verify || cli.flatten_json {
        let mut config = GatekeeperConfig::load(&cli.json)?;
        if cli.verify {
            tracing::info!("config ok");
            return Ok(());
        }
        if !cli.no_hashes {
            config.inject_hashes();
        }
        println!("{}", config.flatten());
        return Ok(());
    }

    let options = build_options(&cli)?;
    orchestrator::run(options).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            // Config and usage problems exit 1; anything else that bubbles
            // up this far is an unrecoverable I/O failure.
            if err.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}
