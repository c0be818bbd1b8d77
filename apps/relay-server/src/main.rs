//! Pub/sub relay for the collaborative note editor
//! Fans document updates, cursor presence, and typing indicators
//! between connected clients

use sync::RelayServer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("relay_server=debug,sync=debug")
        .init();

    let addr = "127.0.0.1:8080";
    let server = RelayServer::new(addr);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
