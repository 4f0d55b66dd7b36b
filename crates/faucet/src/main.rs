//! Faucet service binary

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use testnet_faucet::captcha::{CaptchaVerifier, DisabledCaptcha, RecaptchaVerifier};
use testnet_faucet::chain::EvmRpcClient;
use testnet_faucet::limiter::WindowedLimiter;
use testnet_faucet::logging::init_logging;
use testnet_faucet::wallet::Secp256k1Deriver;
use testnet_faucet::{api, Collaborators, FaucetConfig, FaucetService};
use tokio::signal;
use tracing::{error, info, warn};

const JANITOR_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/faucet.toml")]
    config: String,

    /// Listen port
    #[arg(long, env = "FAUCET_PORT")]
    port: Option<u16>,

    /// Limiter database directory
    #[arg(long)]
    db_path: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = FaucetConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = args.db_path {
        config.db.path = path;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging)?;
    info!("Starting {} faucet v{}", config.project.name, env!("CARGO_PKG_VERSION"));
    info!("  Config: {}", args.config);
    info!("  Networks: {}", config.blockchains.len());

    let limiter = WindowedLimiter::open(&config.db.path)?;

    let captcha: Arc<dyn CaptchaVerifier> = if config.recaptcha.secret_key.is_empty() {
        warn!("reCAPTCHA secret key not set, CAPTCHA verification disabled");
        Arc::new(DisabledCaptcha)
    } else {
        Arc::new(RecaptchaVerifier::new(config.recaptcha.secret_key.clone()))
    };

    let port = config.port;
    let service = Arc::new(FaucetService::new(
        config,
        limiter,
        Collaborators {
            chain: Arc::new(EvmRpcClient::new()),
            captcha,
            deriver: Arc::new(Secp256k1Deriver),
        },
    )?);
    info!("Faucet service initialized");

    let worker = service.spawn_worker();
    let janitor = service.spawn_janitor(JANITOR_PERIOD);

    let app = api::router(service.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutting down gracefully");
    worker.abort();
    janitor.abort();
    if let Err(e) = service.flush().await {
        error!("Failed to flush limiter database: {}", e);
    }
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
