use clap::Parser;
use log::info;
use server::config::Args;
use server::error::ServerError;
use server::network::Server;

/// Parses command line arguments, binds the socket and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), ServerError> {
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: set RUST_LOG=info (or debug) to see server logs");
    }
    env_logger::init();

    let config = Args::parse().into_config();
    info!("Starting state sync server on {}", config.bind_addr);

    let server = Server::new(config).await?;
    server.run().await?;

    info!("Server stopped");
    Ok(())
}
