//! Plain TCP health listener.
//!
//! Accepting and closing a connection is the entire protocol; node-level
//! health checks only need the port to answer.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn listen(port: u16, token: CancellationToken) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "health listener unavailable");
            return;
        }
    };
    info!(port, "health listener up");
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => {
                if let Err(e) = accepted {
                    warn!(error = %e, "health accept failed");
                }
                // connection dropped immediately; liveness is the accept
            }
        }
    }
}
