use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use torswarm_client::{JsonLinesSink, LaunchConfig, ReqwestTransport, TorConfig, TorInstances};
use torswarm_core::config::{JobSpec, SwarmConfig};
use torswarm_core::coordinator::{Coordinator, TracingReporter};
use torswarm_core::outcome::RunSummary;

#[derive(Parser)]
#[command(name = "torswarm", version, about = "Concurrent fetching over many Tor circuits")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured URL and write one JSON line per job
    Run {
        #[command(flatten)]
        options: RunOptions,

        /// Write results to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include response bodies in the output
        #[arg(long, default_value_t = false)]
        include_body: bool,
    },

    /// Print the effective configuration as JSON and exit
    Config {
        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args, Debug, Default)]
struct RunOptions {
    /// TOML configuration file
    #[arg(short, long, env = "TORSWARM_CONFIG")]
    config: Option<PathBuf>,

    /// File with one URL per line (`#` starts a comment)
    #[arg(long)]
    urls: Option<PathBuf>,

    /// URL to fetch (repeatable)
    #[arg(short, long = "url")]
    url: Vec<String>,

    /// Number of circuits, and therefore of concurrent fetches
    #[arg(short = 'n', long, env = "TORSWARM_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Per-fetch timeout in seconds
    #[arg(long, env = "TORSWARM_TIMEOUT")]
    timeout: Option<f64>,

    /// Retries per job after the first attempt
    #[arg(long, env = "TORSWARM_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Base retry delay in seconds, doubled per retry
    #[arg(long, env = "TORSWARM_BACKOFF_BASE")]
    backoff_base: Option<f64>,

    /// Upper bound on the retry delay in seconds
    #[arg(long, env = "TORSWARM_BACKOFF_MAX")]
    backoff_max: Option<f64>,

    /// Rotate every circuit identity on this interval (seconds)
    #[arg(long, env = "TORSWARM_ROTATE_INTERVAL")]
    rotate_interval: Option<f64>,

    /// URL that echoes the caller's IP, fetched on every fresh circuit
    #[arg(long, env = "TORSWARM_IDENTITY_PROBE_URL")]
    identity_probe_url: Option<String>,

    /// Tor control port password
    #[arg(long, env = "TORSWARM_CONTROL_PASSWORD", hide_env_values = true)]
    control_password: Option<String>,

    /// Launch one tor process per circuit instead of using running instances
    #[arg(long, default_value_t = false)]
    launch: bool,

    /// Path to the tor binary (implies --launch)
    #[arg(long, env = "TORSWARM_TOR_CMD")]
    tor_cmd: Option<PathBuf>,
}

/// Layout of the TOML configuration file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    swarm: SwarmConfig,
    tor: TorConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("torswarm=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            options,
            output,
            include_body,
        } => {
            let config = load_config(&options)?;
            let summary = cmd_run(config, output.as_deref(), include_body).await?;
            if summary.is_fatal() {
                anyhow::bail!(
                    "all circuits exhausted; {} of {} jobs interrupted",
                    summary.interrupted,
                    summary.total
                );
            }
        }
        Commands::Config { options } => {
            let mut config = load_config(&options)?;
            if config.tor.control_password.is_some() {
                config.tor.control_password = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Merge the config file, URL sources and flags, then validate.
fn load_config(options: &RunOptions) -> Result<FileConfig> {
    let mut config = match &options.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            parse_config(&text)
                .with_context(|| format!("Invalid config file: {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    if let Some(path) = &options.urls {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL list: {}", path.display()))?;
        config.swarm.jobs.extend(parse_url_list(&text));
    }
    config
        .swarm
        .jobs
        .extend(options.url.iter().cloned().map(JobSpec::Url));

    apply_overrides(&mut config, options)?;
    config.swarm.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

fn parse_config(text: &str) -> Result<FileConfig> {
    Ok(toml::from_str(text)?)
}

fn apply_overrides(config: &mut FileConfig, options: &RunOptions) -> Result<()> {
    let swarm = &mut config.swarm;
    if let Some(pool_size) = options.pool_size {
        swarm.pool_size = pool_size;
    }
    if let Some(timeout) = options.timeout {
        swarm.timeout = seconds(timeout, "--timeout")?;
    }
    if let Some(max_retries) = options.max_retries {
        swarm.max_retries = max_retries;
    }
    if let Some(base) = options.backoff_base {
        swarm.backoff_base = seconds(base, "--backoff-base")?;
    }
    if let Some(max) = options.backoff_max {
        swarm.backoff_max = seconds(max, "--backoff-max")?;
    }
    if let Some(interval) = options.rotate_interval {
        swarm.rotate_interval = Some(seconds(interval, "--rotate-interval")?);
    }
    if let Some(url) = &options.identity_probe_url {
        swarm.identity_probe_url = Some(url.clone());
    }

    let tor = &mut config.tor;
    if let Some(password) = &options.control_password {
        tor.control_password = Some(password.clone());
    }
    if options.launch || options.tor_cmd.is_some() {
        let launch = tor.launch.get_or_insert_with(LaunchConfig::default);
        if let Some(tor_cmd) = &options.tor_cmd {
            launch.tor_cmd = tor_cmd.clone();
        }
    }
    Ok(())
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{flag} must be a non-negative number of seconds"))
}

/// One URL per line; blank lines and `#` comments are skipped.
fn parse_url_list(text: &str) -> Vec<JobSpec> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| JobSpec::Url(line.to_string()))
        .collect()
}

async fn cmd_run(
    config: FileConfig,
    output: Option<&Path>,
    include_body: bool,
) -> Result<RunSummary> {
    let jobs = config
        .swarm
        .build_jobs()
        .map_err(|e| anyhow::anyhow!(e))?;
    if jobs.is_empty() {
        tracing::warn!("No URLs to fetch");
    }

    let sink = match output {
        Some(path) => JsonLinesSink::create(path)
            .await
            .with_context(|| format!("Failed to create output file: {}", path.display()))?,
        None => JsonLinesSink::stdout(),
    }
    .with_body(include_body);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    tracing::info!(
        pool_size = config.swarm.pool_size,
        jobs = jobs.len(),
        launch = config.tor.launch.is_some(),
        "Starting torswarm"
    );

    let coordinator = Coordinator::from_config(
        &config.swarm,
        TorInstances::new(config.tor),
        ReqwestTransport::new(),
        sink,
    )
    .map_err(|e| anyhow::anyhow!(e))?
    .with_cancellation(cancel);

    let summary = coordinator.run(jobs, &TracingReporter).await;

    let report = serde_json::to_string_pretty(&summary)?;
    if output.is_some() {
        println!("{report}");
    } else {
        eprintln!("{report}");
    }
    Ok(summary)
}
