use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use proxy_pipeline::{
    config::{GeoProvider, PipelineConfig, StorageBackend},
    pipeline::{events, IngestCoordinator, PipelineEvent},
    proxy::{
        BulkChecker, CachedResolver, GeoResolver, IpApiResolver, MmdbResolver, NoopResolver, Proxy,
        ProxyType, RawCandidate, ReqwestProbe,
    },
    sources::{fetch_all, CandidateSource, FileSource, UrlListSource},
    storage::{FileStore, PersistenceStore, Session, SqliteStore},
    validation::{ProxyValidator, TestResult, ValidationScheduler, ValidationStats},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Proxy ingestion and validation pipeline
#[derive(Parser)]
#[command(name = "proxy-pipeline", version)]
#[command(about = "Ingest, deduplicate, validate and persist proxy candidates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory (overrides config and STORAGE_DIR)
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest proxy lists through the full pipeline
    Run {
        /// Local proxy list files (can specify multiple)
        #[arg(short, long)]
        input: Vec<PathBuf>,
        /// Plain-text proxy list URLs (can specify multiple)
        #[arg(short, long)]
        url: Vec<String>,
        /// Protocol assumed for entries without a scheme
        #[arg(short = 't', long)]
        proxy_type: Option<String>,
        /// Number of concurrent validations
        #[arg(short = 'n', long)]
        workers: Option<usize>,
        /// Timeout in seconds for each validation request
        #[arg(long)]
        timeout: Option<u64>,
        /// Only deduplicate, enrich and store; no network tests
        #[arg(long)]
        no_tests: bool,
        /// Wait for every validation to finish before exiting
        #[arg(short, long)]
        wait: bool,
    },
    /// Run the validation protocol on a proxy list without storing anything
    Check {
        /// Input file containing proxies
        input: PathBuf,
        /// Protocol assumed for entries without a scheme
        #[arg(short = 't', long)]
        proxy_type: Option<String>,
        /// Number of concurrent validations
        #[arg(short = 'n', long)]
        workers: Option<usize>,
        /// Timeout in seconds for each validation request
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List stored sessions, or the proxies of one session
    Sessions {
        /// Session id to print
        #[arg(short, long)]
        show: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.log_format, cli.debug);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.storage_dir {
        config = config.with_storage_dir(dir);
    }

    match cli.command {
        Commands::Run {
            input,
            url,
            proxy_type,
            workers,
            timeout,
            no_tests,
            wait,
        } => {
            apply_overrides(&mut config, workers, timeout);
            if no_tests {
                config = config.with_run_tests(false);
            }
            config.validate()?;

            let proxy_type = parse_proxy_type(proxy_type.as_deref())?;
            let mut sources: Vec<Box<dyn CandidateSource>> = Vec::new();
            for path in input {
                let mut source = FileSource::new(path);
                if let Some(protocol) = proxy_type {
                    source = source.with_protocol(protocol);
                }
                sources.push(Box::new(source));
            }
            for list_url in url {
                let mut source = UrlListSource::new(list_url)?;
                if let Some(protocol) = proxy_type {
                    source = source.with_protocol(protocol);
                }
                sources.push(Box::new(source));
            }
            if sources.is_empty() {
                anyhow::bail!("Nothing to ingest: pass at least one --input or --url");
            }

            run(config, sources, wait).await?;
        }
        Commands::Check {
            input,
            proxy_type,
            workers,
            timeout,
        } => {
            apply_overrides(&mut config, workers, timeout);
            config.validate()?;
            let proxy_type = parse_proxy_type(proxy_type.as_deref())?;
            check(config, &input, proxy_type).await?;
        }
        Commands::Sessions { show } => {
            let store = open_store(&config, Session::new()).await?;
            match show {
                Some(session_id) => {
                    let proxies = store.session_results(&session_id).await?;
                    if proxies.is_empty() {
                        println!("No proxies stored for {}", session_id);
                    }
                    for proxy in &proxies {
                        println!("{}", describe(proxy));
                    }
                }
                None => {
                    let sessions = store.list_sessions().await?;
                    if sessions.is_empty() {
                        println!("No sessions found.");
                    }
                    for session in sessions {
                        println!("{}", session);
                    }
                }
            }
        }
    }

    Ok(())
}

fn setup_tracing(format: LogFormat, debug: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            tracing_subscriber::EnvFilter::new("proxy_pipeline=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("proxy_pipeline=info,warn")
        }
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
        LogFormat::Compact => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn apply_overrides(config: &mut PipelineConfig, workers: Option<usize>, timeout: Option<u64>) {
    if let Some(workers) = workers {
        config.validator.max_workers = workers;
    }
    if let Some(timeout) = timeout {
        config.validator.timeout = Duration::from_secs(timeout);
    }
}

fn parse_proxy_type(value: Option<&str>) -> Result<Option<ProxyType>> {
    value
        .map(|v| v.parse::<ProxyType>().map_err(anyhow::Error::msg))
        .transpose()
}

async fn open_store(config: &PipelineConfig, session: Session) -> Result<Arc<dyn PersistenceStore>> {
    let base_dir = &config.storage.base_dir;
    let store: Arc<dyn PersistenceStore> = match config.storage.backend {
        StorageBackend::File => Arc::new(
            FileStore::open(base_dir, session)
                .await
                .with_context(|| format!("Failed to open storage at {}", base_dir.display()))?,
        ),
        StorageBackend::Sqlite => {
            let url = config
                .storage
                .sqlite_url
                .as_deref()
                .context("storage.sqlite_url is required by the sqlite backend")?;
            Arc::new(
                SqliteStore::connect(url, base_dir.join("proxy-results"), session)
                    .await
                    .with_context(|| format!("Failed to open database {}", url))?,
            )
        }
    };
    Ok(store)
}

fn build_resolver(config: &PipelineConfig, store: Arc<dyn PersistenceStore>) -> Result<Arc<dyn GeoResolver>> {
    let resolver: Arc<dyn GeoResolver> = match config.geo.provider {
        GeoProvider::IpApi => Arc::new(CachedResolver::new(
            IpApiResolver::with_base_url(&config.geo.ip_api_url, config.geo.timeout)?,
            store,
        )),
        GeoProvider::Mmdb => {
            let path = config
                .geo
                .mmdb_path
                .as_ref()
                .context("geo.mmdb_path is required by the mmdb provider")?;
            let reader = MmdbResolver::from_path(path)
                .with_context(|| format!("Failed to open MMDB file {}", path.display()))?;
            Arc::new(CachedResolver::new(reader, store))
        }
        GeoProvider::None => Arc::new(NoopResolver),
    };
    Ok(resolver)
}

async fn run(config: PipelineConfig, sources: Vec<Box<dyn CandidateSource>>, wait: bool) -> Result<()> {
    let session = Session::new();
    tracing::info!(session = session.id(), "Started new session");

    let store = open_store(&config, session.clone()).await?;
    let geo = build_resolver(&config, store.clone())?;
    let events = events::channel();

    let mut coordinator = IngestCoordinator::new(&config, session.id(), store, geo, events.clone());
    let mut scheduler = None;

    if config.run_tests {
        let probe = Arc::new(ReqwestProbe::new());
        let mut validator = ProxyValidator::new(config.validator.clone(), probe.clone());
        validator.initialize().await;

        let pool = Arc::new(ValidationScheduler::new(
            Arc::new(validator),
            &config.validator,
            events.clone(),
        ));
        tracing::info!(workers = pool.max_workers(), "Validation pool started");

        coordinator = coordinator
            .with_screen(Arc::new(BulkChecker::new(config.screen.clone(), probe)))
            .with_scheduler(pool.clone());
        scheduler = Some(pool);
    }

    coordinator.initialize().await;
    let reporter = tokio::spawn(report_events(events.subscribe()));

    for result in fetch_all(&sources).await {
        if let Some(error) = &result.error {
            eprintln!("Error fetching {}: {}", result.source, error);
            continue;
        }
        println!("Found {} candidates from {}", result.candidates.len(), result.source);
        coordinator.add_raw(result.candidates).await;
    }

    if let (true, Some(pool)) = (wait, &scheduler) {
        println!("Waiting for validation to finish (Ctrl-C to stop early)...");
        tokio::select! {
            _ = pool.wait_for_completion() => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
        }
    }

    match coordinator.shutdown().await {
        Ok(count) => println!("Exported {} proxies to {}", count, session.id()),
        Err(e) => tracing::error!(error = %e, "Final export failed"),
    }
    reporter.abort();

    println!("Tracked proxies: {}", coordinator.tracked_len());
    if let Some(stats) = coordinator.validation_stats() {
        print_stats(&stats);
    }
    Ok(())
}

/// Log discoveries and terminal validation results as they happen
async fn report_events(mut receiver: events::EventReceiver) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match receiver.recv().await {
            Ok(PipelineEvent::Discovered(proxy)) => {
                tracing::debug!(proxy = %proxy, "Discovered proxy");
            }
            Ok(PipelineEvent::Update { queue_len }) => {
                tracing::debug!(queue_len, "Pending queue updated");
            }
            Ok(PipelineEvent::ValidationComplete(result)) => {
                if result.passed {
                    tracing::info!(
                        proxy = %result.proxy,
                        latency_ms = ?result.tests.speed.latency_ms,
                        "Proxy validated"
                    );
                } else {
                    tracing::debug!(proxy = %result.proxy, attempts = result.retry_count + 1, "Proxy rejected");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event reporter lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn check(config: PipelineConfig, input: &Path, proxy_type: Option<ProxyType>) -> Result<()> {
    let candidates = FileSource::new(input).fetch().await?;
    let total = candidates.len();
    let proxies: Vec<Proxy> = candidates
        .into_iter()
        .filter_map(|raw: RawCandidate| Proxy::try_from(raw).ok())
        .map(|mut proxy| {
            if proxy.protocol.is_none() {
                proxy.protocol = proxy_type;
            }
            proxy
        })
        .collect();

    println!("Loaded {} proxies from {:?} ({} malformed)", proxies.len(), input, total - proxies.len());
    println!(
        "Checking with {} workers, timeout: {}s",
        config.validator.max_workers,
        config.validator.timeout.as_secs()
    );
    println!();

    let mut validator = ProxyValidator::new(config.validator.clone(), Arc::new(ReqwestProbe::new()));
    validator.initialize().await;
    match validator.real_ip() {
        Some(ip) => println!("Real IP: {}", ip),
        None => println!("Real IP unknown; anonymity check will be skipped"),
    }

    let scheduler = ValidationScheduler::new(Arc::new(validator), &config.validator, events::channel());
    scheduler.enqueue(proxies);
    scheduler.wait_for_completion().await;

    let mut results = scheduler.results();
    results.sort_by(|a, b| b.passed.cmp(&a.passed).then_with(|| a.proxy.full().cmp(&b.proxy.full())));
    for result in &results {
        let tests = &result.tests;
        println!(
            "{} {:<22} conn:{} speed:{} anon:{} geo:{}",
            if result.passed { "✓" } else { "✗" },
            result.proxy.full(),
            stage(&tests.connectivity),
            stage(&tests.speed),
            stage(&tests.anonymity),
            stage(&tests.geolocation),
        );
    }
    println!();
    print_stats(&scheduler.get_stats());
    scheduler.shutdown().await;
    Ok(())
}

fn stage(result: &TestResult) -> String {
    match (result.passed, result.latency_ms) {
        (true, Some(ms)) => format!("ok({}ms)", ms),
        (true, None) => "ok".to_string(),
        (false, _) => "fail".to_string(),
    }
}

fn describe(proxy: &Proxy) -> String {
    let protocol = proxy
        .protocol
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let country = proxy.country.as_deref().unwrap_or("Unknown");
    format!("{} [{}] {}", proxy.full(), protocol, country)
}

fn print_stats(stats: &ValidationStats) {
    println!(
        "Validation: {} total, {} passed, {} failed, {} pending, {} discarded",
        stats.total, stats.passed, stats.failed, stats.pending, stats.discarded
    );
    println!(
        "Success rate: {:.1}%, average latency: {:.0}ms",
        stats.success_rate, stats.average_latency_ms
    );
}
