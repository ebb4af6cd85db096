//! Monitor Service (monsrv)
//!
//! Polls the gateway devices and serves their data over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use common::{init_with_config, run_with_watchdog, wait_for_shutdown, LogConfig};
use monsrv::api::create_router;
use monsrv::config::Config;
use monsrv::AppContext;

#[derive(Parser, Debug)]
#[command(name = "monsrv", about = "Modbus gateway monitor service")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "MONSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - load and validate the configuration, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    init_with_config(LogConfig {
        service_name: "monsrv".to_string(),
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        log_dir: config.logging.dir.clone(),
        ansi: !args.no_color,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    config.validate()?;
    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let context = Arc::new(AppContext::open(config.clone()).await?);
    context.start().await;

    let shutdown_token = CancellationToken::new();
    let server_handle = if config.server.enabled {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("API server listening on http://{}", addr);

        let app = create_router(Arc::clone(&context));
        let server_token = shutdown_token.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move { server_token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Server error: {}", e);
            }
        }))
    } else {
        info!("API server disabled");
        None
    };

    let signal = wait_for_shutdown().await;
    info!("Starting shutdown ... (caused by {})", signal);

    let sequence = async {
        let mut failures = 0;
        context.stop_monitor().await;

        shutdown_token.cancel();
        if let Some(handle) = server_handle {
            if let Err(e) = handle.await {
                error!("Server task failed: {}", e);
                failures += 1;
            }
        }

        failures += context.close_devices().await;
        failures
    };

    match run_with_watchdog(config.shutdown_deadline(), sequence).await {
        Some(0) => {
            info!("Shutdown complete");
            Ok(())
        },
        Some(failures) => bail!("Shutdown finished with {} failed steps", failures),
        None => bail!(
            "Shutdown did not finish within {:?}",
            config.shutdown_deadline()
        ),
    }
}
