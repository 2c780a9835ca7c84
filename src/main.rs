use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use thl_server::{Config, DistributionServer, MemoryLogStore};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "thl-server")]
#[command(about = "Transaction History Log distribution server", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `server.uri` from the configuration file
    #[arg(short, long, value_name = "URI")]
    uri: Option<String>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting thl-server");
    info!("Loading configuration from {:?}", args.config);

    let mut config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };
    if let Some(uri) = args.uri {
        config.server.uri = uri;
    }

    info!(
        uri = %config.server.uri,
        store_name = %config.server.store_name,
        protocol = %config.server.protocol,
        catalog_schema = ?config.filter.as_ref().map(|f| f.catalog_schema.as_str()),
        secure = config.security.is_some(),
        "Configuration summary"
    );

    let store = Arc::new(MemoryLogStore::new(config.server.store_name.clone()));
    let mut server = DistributionServer::new(config, store).context("creating THL server")?;
    server.start().await.context("starting THL server")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    let report = server.stop().await.context("stopping THL server")?;
    if report.is_clean() {
        info!("THL server shut down cleanly");
    } else {
        warn!(
            unfinished = report.unfinished,
            handler_errors = report.handler_errors,
            accept_error = ?report.accept_error,
            "THL server shut down with errors"
        );
    }

    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over `--verbose`. JSON
/// output keeps the current span so connection ids reach every line.
fn init_logging(json: bool, verbose: bool) {
    let fallback = if verbose {
        "thl_server=debug,info"
    } else {
        "thl_server=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry.with(fmt::layer().with_target(verbose)).init();
    }
}
