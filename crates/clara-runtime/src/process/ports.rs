//! Port probing for subprocess allocation.

use anyhow::{Result, anyhow};
use std::net::TcpListener;
use tracing::debug;

/// How far past the assigned port a start may advance when the port is
/// already bound by an external process.
pub const PORT_SEARCH_WINDOW: u16 = 1024;

/// Check if a port is available by attempting to bind to it.
/// The listener is dropped immediately, which releases the port.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

/// First free port at or after `base`, within `window` ports.
pub fn find_available(base: u16, window: u16) -> Result<u16> {
    for offset in 0..window {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        if is_port_available(port) {
            if offset > 0 {
                debug!(port, base, "assigned port was bound, advanced");
            }
            return Ok(port);
        }
    }
    Err(anyhow!(
        "no available port in range {}-{}",
        base,
        base.saturating_add(window)
    ))
}
