use clap::Parser;
use dbss::config::{AppConfig, Args};
use dbss::network::{Server, ServerError, ServerMessage};
use log::{error, info, warn};

/// Main-method of the application.
/// Loads the configuration, then runs the DBSS until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), ServerError> {
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Hint: set RUST_LOG=info (or debug) to see DBSS logs");
    }
    env_logger::init();

    let args = Args::parse();
    let config = AppConfig::from_args(&args).await?.validate()?;

    info!(
        "Serving objects {} with database channel {}",
        config.range, config.database
    );
    if config.classes.is_empty() {
        warn!("No classes configured; every load will fail");
    }

    let mut server = Server::new(&config, rand::random()).await?;

    // Handle shutdown gracefully
    let control = server.control_sender();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                if control.send(ServerMessage::Shutdown).is_err() {
                    error!("Server loop already stopped");
                }
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await
}
