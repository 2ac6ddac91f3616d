//! Gateway server binary.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `GATEWAY_WS_BIND` | `127.0.0.1:8765` | WebSocket listener |
//! | `GATEWAY_HTTP_BIND` | `127.0.0.1:8766` | HTTP listener |
//! | `GATEWAY_AUTH_SECRET` | — | Shared secret (else key file) |
//! | `GATEWAY_KEY_FILE` | `.gateway-key` | Key-file path |
//! | `GATEWAY_DISABLE_AUTH` | unset | Any value disables the handshake |
//! | `RUST_LOG` | `info` | Log filter |

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use browser_gateway::{Gateway, GatewayConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let gateway = Gateway::start(config_from_env()?).await?;
    info!(
        ws = %gateway.ws_addr(),
        http = %gateway.http_addr(),
        "Browser control gateway running"
    );

    tokio::signal::ctrl_c().await?;
    gateway.shutdown();
    Ok(())
}

/// Builds the configuration from environment variables.
fn config_from_env() -> Result<GatewayConfig> {
    let mut config = GatewayConfig::new();

    if let Ok(bind) = std::env::var("GATEWAY_WS_BIND") {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| browser_gateway::Error::config(format!("GATEWAY_WS_BIND: {e}")))?;
        config = config.with_ws_bind(addr);
    }
    if let Ok(bind) = std::env::var("GATEWAY_HTTP_BIND") {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| browser_gateway::Error::config(format!("GATEWAY_HTTP_BIND: {e}")))?;
        config = config.with_http_bind(addr);
    }
    if let Ok(path) = std::env::var("GATEWAY_KEY_FILE") {
        config = config.with_key_file(path);
    }
    if std::env::var("GATEWAY_DISABLE_AUTH").is_ok() {
        config = config.without_auth();
    }

    Ok(config)
}
