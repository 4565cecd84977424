//! Waypoint signaling server binary.
//!
//! Starts the presence-and-signaling WebSocket server. The listen port
//! comes from `--port`, falling back to the `PORT` environment variable,
//! then to 5000.

use log::{error, info};
use waypoint_signal::{ServerConfig, SignalServer};

fn listen_port() -> u16 {
    std::env::args()
        .skip_while(|arg| arg != "--port")
        .nth(1)
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|port| port.parse().ok())
        .unwrap_or(5000)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: format!("0.0.0.0:{}", listen_port()),
        ..ServerConfig::default()
    };

    info!("Starting waypoint signaling server on {}", config.bind_addr);
    let server = SignalServer::new(config);

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
