//! Command-line harness for the Dashboard Pro cache lifecycle manager.
//!
//! Drives a `ServiceWorkerContainer` against a live origin (via reqwest) or
//! against the in-memory stub origin, and prints what the worker did.

mod report;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dashboard_common::{init_logging, LogConfig, LogFormat};
use dashboard_net::{Fetcher, HttpFetcher, LoaderConfig, Request, StubFetcher};
use dashboard_sw::{
    ControlMessage, ControlReply, MessageTarget, ServiceWorkerContainer, ServiceWorkerEvent,
    WorkerConfig,
};
use http::StatusCode;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use url::Url;

const DEMO_ORIGIN: &str = "http://localhost:3000/";

#[derive(Parser)]
#[command(name = "sw-probe")]
#[command(about = "Exercise the offline cache lifecycle manager")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogStyle::Compact, global = true)]
    log_format: LogStyle,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tracing filter directive (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogStyle {
    Pretty,
    Compact,
    Json,
}

impl From<LogStyle> for LogFormat {
    fn from(style: LogStyle) -> Self {
        match style {
            LogStyle::Pretty => LogFormat::Pretty,
            LogStyle::Compact => LogFormat::Compact,
            LogStyle::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print or write the default worker configuration
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Install a generation against a live origin and print partition statistics
    Install {
        /// Origin the worker controls
        #[arg(long)]
        origin: Url,

        /// Worker configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Install, then fetch each path twice through the worker
    Fetch {
        /// Origin the worker controls
        #[arg(long)]
        origin: Url,

        /// Worker configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Paths relative to the origin
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run install / fetch / offline / upgrade against the in-memory origin
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = match (cli.verbose, cli.log_format) {
        (true, _) => LogConfig::debug(),
        (false, LogStyle::Json) => LogConfig::production(),
        (false, _) => LogConfig::default(),
    };
    log_config.format = cli.log_format.into();
    if let Some(filter) = cli.log_filter {
        log_config = log_config.with_filter(filter);
    }
    init_logging(log_config)?;

    match cli.command {
        Commands::Config { output } => {
            let config = WorkerConfig::default();
            match output {
                Some(path) => {
                    config.to_json_file(&path)?;
                    println!("Configuration written to {}", path.display());
                }
                None => println!("{}", config.to_json()?),
            }
        }

        Commands::Install { origin, config } => {
            let config = load_config(config)?;
            let (container, mut events) = live_container(origin)?;

            let id = container.register(config).await?;
            print_events(&mut events);
            println!("Installed {id}");
            print_stats(&container).await?;
        }

        Commands::Fetch {
            origin,
            config,
            paths,
        } => {
            let config = load_config(config)?;
            let (container, mut events) = live_container(origin.clone())?;
            container.register(config).await?;
            print_events(&mut events);

            println!("Fetches:");
            for path in &paths {
                let url = origin
                    .join(path)
                    .with_context(|| format!("invalid path {path}"))?;
                for _ in 0..2 {
                    fetch_and_print(&container, path, Request::get(url.clone())).await?;
                }
            }
        }

        Commands::Demo => run_demo().await?,
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::from_json_file(&path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(WorkerConfig::default()),
    }
}

fn live_container(
    origin: Url,
) -> Result<(ServiceWorkerContainer, UnboundedReceiver<ServiceWorkerEvent>)> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    Ok(ServiceWorkerContainer::new(origin, fetcher))
}

async fn fetch_and_print(container: &ServiceWorkerContainer, path: &str, request: Request) -> Result<()> {
    let route = match container.controller().await {
        Some(worker) => worker.router().classify(&request),
        None => None,
    };
    let response = container.fetch(request).await?;
    println!("{}", report::fetch_line(path, route, &response));
    Ok(())
}

fn print_events(events: &mut UnboundedReceiver<ServiceWorkerEvent>) {
    println!("Lifecycle:");
    while let Ok(event) = events.try_recv() {
        println!("{}", report::event_line(&event));
    }
}

async fn print_stats(container: &ServiceWorkerContainer) -> Result<()> {
    let reply = container
        .post_message(MessageTarget::Active, ControlMessage::GetCacheStats)
        .await?;
    let Some(ControlReply::CacheStats { partitions }) = reply else {
        bail!("active worker did not report cache statistics");
    };
    println!("Partitions:");
    print!("{}", report::stats_table(&partitions));
    Ok(())
}

/// Scripted walk through a full generation swap on the stub origin.
async fn run_demo() -> Result<()> {
    let scope = Url::parse(DEMO_ORIGIN)?;
    let origin = Arc::new(StubFetcher::new(scope.clone()));
    let fetcher: Arc<dyn Fetcher> = origin.clone();
    let (container, mut events) = ServiceWorkerContainer::new(scope.clone(), fetcher);

    let config = WorkerConfig::default();
    for path in &config.static_assets {
        origin.ok(path, format!("asset {path}")).await?;
    }
    origin.ok("/api/projects", r#"[{"id":1,"name":"Atlas"}]"#).await?;
    origin.ok("/icons/logo.png", "png-v1").await?;
    origin
        .route("/health", StatusCode::SERVICE_UNAVAILABLE, "degraded")
        .await?;

    container.connect_client(scope.clone()).await;
    let first = container.register(config.clone()).await?;
    println!("== install {first}");
    print_events(&mut events);
    print_stats(&container).await?;

    println!("\n== online");
    for path in ["/", "/api/projects", "/icons/logo.png", "/health", "/reports/q3"] {
        let request = Request::parse(&origin.resolve(path)?)?;
        fetch_and_print(&container, path, request).await?;
    }

    println!("\n== offline");
    origin.set_offline(true);
    for path in ["/", "/api/projects", "/icons/logo.png", "/api/unseen"] {
        let request = Request::parse(&origin.resolve(path)?)?;
        fetch_and_print(&container, path, request).await?;
    }
    origin.set_offline(false);

    println!("\n== upgrade");
    let second = container.register(config.with_version("v1.1.0")).await?;
    print_events(&mut events);
    debug!(previous = %first, current = %second, "Generation swapped");
    print_stats(&container).await?;

    let reply = container
        .post_message(MessageTarget::Active, ControlMessage::GetVersion)
        .await?;
    if let Some(ControlReply::Version { version, .. }) = reply {
        println!("Active version: {version}");
    }
    println!("Origin served {} requests", origin.total_calls().await);

    Ok(())
}
