//! exitmap - per-exit-relay web connectivity measurements over Tor
//!
//! ## Commands
//!
//! - `run`: measure every running exit relay and write one row per URL
//! - `relays`: print the exit relay worklist without launching tor

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use exitmap_core::config::default_data_dir;
use exitmap_core::{
    ClickHouseSink, CsvSink, DirectoryClient, LogSink, MeasurementOrchestrator, ProbeConfig,
    RelayDirectory, ResultSink, TorLaunchConfig, TorLauncher, DEFAULT_DIRECTORY_URL, DEFAULT_URLS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "exitmap")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Web connectivity measurements through every Tor exit relay", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure every running exit relay
    Run(RunArgs),

    /// Print the running exit relays without launching tor
    Relays {
        #[command(flatten)]
        directory: DirectoryArgs,
    },
}

#[derive(Args)]
struct DirectoryArgs {
    /// Onionoo details URL
    #[arg(long, env = "EXITMAP_DIRECTORY_URL", default_value = DEFAULT_DIRECTORY_URL)]
    directory_url: String,

    /// Directory request timeout in seconds
    #[arg(long, env = "EXITMAP_DIRECTORY_TIMEOUT", default_value_t = 60)]
    directory_timeout: u64,

    /// Keep directory order instead of shuffling
    #[arg(long, env = "EXITMAP_NO_RANDOMIZE")]
    no_randomize: bool,

    /// Seed for the worklist shuffle and guard choice
    #[arg(long, env = "EXITMAP_SEED")]
    seed: Option<u64>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    directory: DirectoryArgs,

    /// URL to probe; repeat or comma-separate (default: four robots.txt URLs)
    #[arg(long = "url", env = "EXITMAP_URLS", value_delimiter = ',')]
    urls: Vec<String>,

    /// Per-URL fetch timeout in seconds
    #[arg(long, env = "EXITMAP_FETCH_TIMEOUT", default_value_t = 10)]
    fetch_timeout: u64,

    /// Circuit build timeout in seconds
    #[arg(long, env = "EXITMAP_BUILD_TIMEOUT", default_value_t = 60)]
    build_timeout: u64,

    /// tor executable
    #[arg(long, env = "EXITMAP_TOR_BINARY", default_value = "tor")]
    tor_binary: PathBuf,

    /// tor data directory (default: ~/.config/txexitmap/tor_datadir)
    #[arg(long, env = "EXITMAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// File receiving tor INFO events
    #[arg(long, env = "EXITMAP_TOR_LOG")]
    tor_log: Option<PathBuf>,

    /// Seconds allowed for tor to start and bootstrap
    #[arg(long, env = "EXITMAP_LAUNCH_TIMEOUT", default_value_t = 180)]
    launch_timeout: u64,

    /// Extra torrc option for the launched tor; repeatable
    #[arg(long = "tor-option", value_name = "KEY=VALUE", value_parser = parse_torrc_option)]
    torrc_options: Vec<(String, String)>,

    /// Where rows go
    #[arg(long, value_enum, env = "EXITMAP_SINK", default_value_t = SinkKind::Csv)]
    sink: SinkKind,

    /// Output file for `--sink csv`
    #[arg(long, env = "EXITMAP_CSV_PATH", default_value = "exitmap-results.csv")]
    csv_path: PathBuf,

    /// ClickHouse HTTP endpoint for `--sink clickhouse`
    #[arg(long, env = "EXITMAP_CLICKHOUSE_URL", default_value = "http://localhost:8123")]
    clickhouse_url: String,

    /// ClickHouse database holding `tor_web_connectivity`
    #[arg(long, env = "EXITMAP_CLICKHOUSE_DATABASE", default_value = "default")]
    clickhouse_database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    Csv,
    Clickhouse,
    Log,
}

impl RunArgs {
    fn probe_config(&self) -> ProbeConfig {
        let urls = if self.urls.is_empty() {
            DEFAULT_URLS.iter().map(|u| u.to_string()).collect()
        } else {
            self.urls.clone()
        };
        ProbeConfig {
            directory_url: self.directory.directory_url.clone(),
            randomize: !self.directory.no_randomize,
            urls,
            fetch_timeout_secs: self.fetch_timeout,
            build_timeout_secs: self.build_timeout,
            directory_timeout_secs: self.directory.directory_timeout,
            tor: TorLaunchConfig {
                tor_binary: self.tor_binary.clone(),
                data_dir: self.data_dir.clone().unwrap_or_else(default_data_dir),
                log_file: self.tor_log.clone(),
                launch_timeout_secs: self.launch_timeout,
                torrc_options: self.torrc_options.clone(),
            },
        }
    }
}

fn parse_torrc_option(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("missing option name in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    exitmap_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Relays { directory } => cmd_relays(directory).await,
    }
}

fn resolve_seed(directory: &DirectoryArgs) -> u64 {
    let seed = directory.seed.unwrap_or_else(rand::random);
    info!(seed, "random seed");
    seed
}

/// Measure every running exit relay
async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = args.probe_config();
    let seed = resolve_seed(&args.directory);

    let directory = DirectoryClient::with_rng(
        &config.directory_url,
        config.directory_timeout(),
        StdRng::seed_from_u64(seed),
    )
    .context("Failed to build directory client")?;

    let mut launcher = TorLauncher::new(config.tor.launch_options());
    if let Some(path) = &config.tor.log_file {
        launcher = launcher
            .with_log_file(path)
            .await
            .with_context(|| format!("Failed to open tor log {}", path.display()))?;
    }

    let sink: Box<dyn ResultSink> = match args.sink {
        SinkKind::Csv => Box::new(
            CsvSink::create(&args.csv_path)
                .with_context(|| format!("Failed to create {}", args.csv_path.display()))?,
        ),
        SinkKind::Clickhouse => {
            info!(url = %args.clickhouse_url, "writing rows to ClickHouse");
            Box::new(ClickHouseSink::new(&args.clickhouse_url, &args.clickhouse_database))
        }
        SinkKind::Log => Box::new(LogSink),
    };

    let mut orchestrator = MeasurementOrchestrator::with_rng(
        directory,
        launcher,
        sink,
        &config,
        StdRng::seed_from_u64(seed.wrapping_add(1)),
    );
    let report = orchestrator
        .run()
        .await
        .context("Measurement run aborted")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print the running exit relays without launching tor
async fn cmd_relays(args: DirectoryArgs) -> Result<()> {
    let seed = resolve_seed(&args);
    let directory = DirectoryClient::with_rng(
        &args.directory_url,
        std::time::Duration::from_secs(args.directory_timeout),
        StdRng::seed_from_u64(seed),
    )
    .context("Failed to build directory client")?;

    let relays = directory
        .fetch(!args.no_randomize)
        .await
        .context("Failed to fetch relay directory")?;

    for relay in &relays {
        println!(
            "{}  {:<20} {:<3} {}",
            relay.fingerprint, relay.nickname, relay.country, relay.asn
        );
    }
    info!(count = relays.len(), "running exit relays");
    Ok(())
}
