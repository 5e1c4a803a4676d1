use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use node_sieve::{
    config::{AppConfig, ConfigLoader, DetectMode},
    proxy::{BatchValidator, NameFilter, NodeParser},
    report::RunReport,
    reputation::{
        AbuseIpDbClient, AbuseIpDbConfig, Classifier, IpApiClient, IpApiConfig,
        ReputationDetector,
    },
};
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

/// Timeout for downloading node lists
const SOURCE_FETCH_TIMEOUT_SECS: u64 = 30;

/// Proxy node validator and datacenter detector
#[derive(Parser)]
#[command(name = "node-sieve")]
#[command(about = "Test proxy nodes and drop the ones egressing from datacenters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, filter, test and classify nodes, then write a report
    Check(CheckArgs),
    /// Look up and classify IP addresses
    Classify {
        /// IP addresses to classify
        #[arg(required = true)]
        ips: Vec<String>,
        /// AbuseIPDB API key
        #[arg(long, env = "ABUSEIPDB_API_KEY")]
        abuseipdb_key: Option<String>,
    },
}

#[derive(Args)]
struct CheckArgs {
    /// Node list URL (can specify multiple)
    #[arg(short = 's', long = "subscription")]
    urls: Vec<String>,
    /// Node list file (can specify multiple)
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,
    /// Report output path
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Run connectivity tests through the engine
    #[arg(long)]
    test: bool,
    /// Skip datacenter detection
    #[arg(long)]
    no_detect: bool,
    /// Which IP to classify
    #[arg(long, value_enum)]
    mode: Option<DetectMode>,
    /// Engine binary path
    #[arg(long)]
    engine_bin: Option<PathBuf>,
    /// Nodes tested per engine batch
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,
    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// AbuseIPDB API key
    #[arg(long, env = "ABUSEIPDB_API_KEY")]
    abuseipdb_key: Option<String>,
}

impl CheckArgs {
    fn apply(self, config: &mut AppConfig) {
        if !self.urls.is_empty() || !self.files.is_empty() {
            config.sources.urls = self.urls;
            config.sources.files = self.files;
        }
        if let Some(output) = self.output {
            config.output.path = output;
        }
        if self.test {
            config.connectivity.enabled = true;
        }
        if self.no_detect {
            config.detection.enabled = false;
        }
        if self.mode.is_some() {
            config.detection.mode = self.mode;
        }
        if let Some(bin) = self.engine_bin {
            config.connectivity.engine_bin = bin;
        }
        if let Some(n) = self.concurrency {
            config.connectivity.concurrency = n;
        }
        if let Some(secs) = self.timeout {
            config.connectivity.timeout_secs = secs;
        }
        if self.abuseipdb_key.is_some() {
            config.detection.abuseipdb_key = self.abuseipdb_key;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = if cli.verbose {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
    } else {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ConfigLoader::load_or_default(cli.config).context("Failed to load config")?;

    match cli.command {
        Commands::Check(args) => {
            args.apply(&mut config);
            run_check(config).await
        }
        Commands::Classify { ips, abuseipdb_key } => {
            if abuseipdb_key.is_some() {
                config.detection.abuseipdb_key = abuseipdb_key;
            }
            run_classify(&config, &ips).await
        }
    }
}

fn build_detector(config: &AppConfig) -> Result<ReputationDetector> {
    let classifier_config = config
        .detection
        .classifier_config()
        .context("Failed to load classifier data")?;
    let lookup = IpApiClient::new(IpApiConfig::new())?;
    let mut detector = ReputationDetector::new(lookup, Classifier::new(classifier_config));

    if let Some(key) = config.detection.abuse_key() {
        detector = detector.with_abuse(AbuseIpDbClient::new(AbuseIpDbConfig::new(key.to_string()))?);
    }
    Ok(detector)
}

async fn run_check(config: AppConfig) -> Result<()> {
    if config.sources.is_empty() {
        bail!("No node sources given; use --file/--subscription or [sources] in the config file");
    }

    // Classifier data errors should surface before any engine starts.
    let detector = if config.detection.enabled {
        Some(build_detector(&config)?)
    } else {
        None
    };

    info!("[1] Loading nodes...");
    let client = Client::builder()
        .timeout(Duration::from_secs(SOURCE_FETCH_TIMEOUT_SECS))
        .build()?;
    let nodes = NodeParser::load_sources(&client, &config.sources.files, &config.sources.urls)
        .await
        .context("Failed to load nodes")?;
    if nodes.is_empty() {
        bail!("No nodes loaded");
    }
    info!("Loaded {} nodes", nodes.len());

    info!("[2] Filtering by name...");
    let filter = NameFilter::new(&config.filter.name_blacklist, &config.filter.name_whitelist);
    let (nodes, filtered) = filter.apply(nodes);

    let results = if config.connectivity.enabled {
        info!("[3] Testing connectivity...");
        let validator = BatchValidator::with_config(config.connectivity.validator_config());
        Some(validator.validate(&nodes).await)
    } else {
        info!("[3] Connectivity test skipped");
        None
    };

    let detection = match &detector {
        Some(detector) => {
            let mode = config.detection.effective_mode(config.connectivity.enabled);
            if config.detection.mode == Some(DetectMode::Exit) && mode == DetectMode::Entry {
                warn!("Exit IP detection needs connectivity testing; using entry IPs");
            }
            match (mode, &results) {
                (DetectMode::Exit, Some(results)) => {
                    info!("[4] Classifying exit IPs...");
                    Some(detector.detect_exit(results).await)
                }
                _ => {
                    info!("[4] Classifying entry IPs...");
                    let candidates: Vec<_> = match &results {
                        Some(results) => {
                            let alive: std::collections::HashSet<&str> = results
                                .iter()
                                .filter(|r| r.is_alive())
                                .map(|r| r.name())
                                .collect();
                            nodes
                                .iter()
                                .filter(|n| alive.contains(n.name.as_str()))
                                .cloned()
                                .collect()
                        }
                        None => nodes.clone(),
                    };
                    Some(detector.detect_entry(&candidates).await)
                }
            }
        }
        None => {
            info!("[4] Datacenter detection skipped");
            None
        }
    };

    let report = RunReport::build(&nodes, &filtered, results.as_deref(), detection.as_ref());
    report
        .write_json(&config.output.path)
        .with_context(|| format!("Failed to write report to {:?}", config.output.path))?;

    let s = &report.summary;
    println!(
        "Results: {} total, {} kept, {} unknown, {} datacenter, {} dead, {} filtered",
        s.total, s.kept, s.unknown, s.datacenter, s.dead, s.filtered
    );
    for node in report.kept() {
        match node.delay_ms {
            Some(delay) => println!("  {} ({}ms)", node.name, delay),
            None => println!("  {}", node.name),
        }
    }

    Ok(())
}

async fn run_classify(config: &AppConfig, ips: &[String]) -> Result<()> {
    let detector = build_detector(config)?;
    let verdicts = detector.classify_ips(ips).await;

    for ip in ips {
        if let Some(v) = verdicts.get(ip) {
            let label = if v.verdict.is_datacenter {
                "datacenter"
            } else {
                "residential"
            };
            println!(
                "{} {} [{}] {}: {}",
                ip, label, v.country_code, v.org, v.verdict.reason
            );
        }
    }
    Ok(())
}
