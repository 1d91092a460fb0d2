//! HTTP surface
//!
//! Maps requests on the fixed loopback address onto core operations. The
//! actual logic lives in [`crate::core`]; this layer converts path
//! variables, hex bodies and JSON, enforces the origin policy, and wires
//! client disconnects to core cancellation.

pub mod api;
pub mod cors;
pub mod status;

pub use api::{router, AppState};

use crate::core::Core;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// The bridge port is fixed; clients hardcode it.
pub const BIND_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 21325);

/// Bind the loopback listener and serve until the process exits.
pub async fn serve(core: Core, version: String) -> std::io::Result<()> {
    let addr = SocketAddr::from(BIND_ADDR);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(AppState { core, version })).await
}
