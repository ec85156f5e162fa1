use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rowcache::config::{RowcacheConfig, SourceConfig};
use rowcache::refresh::{RefreshCoordinator, RefreshWorker};
use rowcache::service::{LookupService, Server};
use rowcache::source::SqliteSource;
use rowcache::stats::{table_metrics, MetricsHttpServer, PrometheusRenderer, RenderFn};
use rowcache::table::TableRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rowcache-server", about = "Serve cached database tables over a socket")]
struct Args {
    /// Config file; defaults to $ROWCACHE_CONFIG
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// TCP listen address, overriding the config
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Load every table once, print their stats as JSON and exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "rowcache-server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => RowcacheConfig::load(Some(path.as_path()))?,
        None => RowcacheConfig::load_from_env()?,
    };

    let registry = Arc::new(TableRegistry::new(config.to_table_specs()?)?);
    let source = match config.source_config()? {
        SourceConfig::Sqlite { path, strip_null } => {
            SqliteSource::new(path).with_strip_null(strip_null)
        }
    };
    let coordinator = Arc::new(
        RefreshCoordinator::new(Arc::clone(&registry), source)
            .with_memory_limits(config.to_memory_limits()?),
    );

    // Serving without a complete first generation of every table is not allowed.
    coordinator.initial_load()?;

    let service = Arc::new(LookupService::new(Arc::clone(&registry)));
    if args.check {
        let stats: Vec<_> = registry
            .iter()
            .filter_map(|entry| service.stats(entry.spec().id()))
            .collect();
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut worker = RefreshWorker::new(&coordinator, config.to_worker_config());
    worker.start();

    let mut server_config = config.to_server_config()?;
    if let Some(listen) = args.listen {
        server_config.tcp = Some(listen);
    }
    let metrics_addr = config.metrics_addr()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rowcache-io")
        .build()?;
    let served = runtime.block_on(async {
        let server = Server::bind(server_config, Arc::clone(&service)).await?;
        let metrics = match metrics_addr {
            Some(addr) => {
                let service = Arc::clone(&service);
                let coordinator = Arc::clone(&coordinator);
                let renderer = PrometheusRenderer::new();
                let render: RenderFn = Arc::new(move || {
                    renderer.render(
                        &service.metrics().snapshot(),
                        &table_metrics(&service, &coordinator),
                    )
                });
                let metrics = MetricsHttpServer::bind(addr, render).await?;
                info!(addr = %metrics.local_addr(), "metrics endpoint listening");
                Some(metrics)
            }
            None => None,
        };

        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        server.shutdown().await?;
        if let Some(metrics) = metrics {
            metrics.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    worker.stop();
    served?;
    Ok(())
}
