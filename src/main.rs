use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use webrtc_conference::config::ServerConfig;
use webrtc_conference::server::auth::NoAuth;
use webrtc_conference::server::registry::RoomRegistry;
use webrtc_conference::server::router::MessageRouter;
use webrtc_conference::server::store::NullStore;
use webrtc_conference::server::SignalingServer;

#[tokio::main]
async fn main() -> webrtc_conference::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("webrtc_conference=info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let registry = Arc::new(RoomRegistry::new());
    let router = Arc::new(MessageRouter::new(registry, Arc::new(NullStore)));
    let server = SignalingServer::bind(&config.bind_addr, router, Arc::new(NoAuth)).await?;
    server.run().await
}
