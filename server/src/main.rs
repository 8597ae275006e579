use clap::Parser;
use log::info;
use server::config::{ServerConfig, DEFAULT_PORT};
use server::network::Server;

/// Interactive FDTD field streaming server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        port: args.port,
        ..ServerConfig::from_env()?
    };

    info!(
        "Starting server: {} grid, {:?} backend, {} workers, {:?} tick",
        config.grid, config.backend, config.worker_threads, config.tick
    );

    let server = Server::bind(config).await?;

    tokio::select! {
        _ = server.run() => {}
        _ = shutdown_signal() => info!("Shutdown signal received, stopping server"),
    }

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM where available.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
