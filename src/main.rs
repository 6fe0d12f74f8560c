//! CLI entrypoint: parse flags, wire `Core`, run the gateway until shutdown.

use anyhow::Result;
use clap::Parser;
use gateway_core::auth::InMemorySecretResolver;
use gateway_core::config::GatewayConfig;
use gateway_core::{ipc, Core};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "gatewayd", about = "Realtime messaging gateway for an AI agent platform", version)]
struct Args {
    /// WebSocket server port
    #[arg(long, env = "GATEWAY_PORT")]
    port: Option<u16>,

    /// Data directory holding config.toml
    #[arg(long, env = "GATEWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GATEWAY_LOG")]
    log: Option<String>,

    /// Shared secret used to verify inbound JWTs
    #[arg(long, env = "GATEWAY_JWT_SECRET")]
    jwt_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();

    let jwt_secret = match args.jwt_secret {
        Some(s) => s,
        None => {
            // Running without a verification secret would accept every token —
            // this is a startup configuration error, not a recoverable condition.
            eprintln!("FATAL: no JWT secret configured — set --jwt-secret or GATEWAY_JWT_SECRET");
            std::process::exit(1);
        }
    };

    let config = GatewayConfig::new(args.port, args.data_dir, args.log);
    info!(port = config.port, data_dir = %config.data_dir.display(), "gateway starting");

    let secret_resolver = Arc::new(InMemorySecretResolver::new(jwt_secret));
    let core = Core::new(config, secret_resolver);

    ipc::run(core).await
}
