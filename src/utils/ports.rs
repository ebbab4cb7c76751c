// Port probing for the web-server binding stage.

use anyhow::Result;
use std::net::TcpListener;

/// How far above the requested port we scan before giving up.
const PORT_SCAN_SPAN: u16 = 200;

/// Return true when `port` can currently be bound on all interfaces.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Pick the first free port at or above `requested`.
///
/// The chosen port is what gets written to the instance record, so the
/// caller must report it back rather than assume the requested one.
pub fn first_free_port(requested: u16) -> Result<u16> {
    let upper = requested.saturating_add(PORT_SCAN_SPAN);
    for port in requested..=upper {
        if port_is_free(port) {
            return Ok(port);
        }
    }
    Err(anyhow::anyhow!(
        "No free port found in range {}..={}",
        requested,
        upper
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_free_port_skips_occupied_port() {
        // Hold a port open, then ask for it: we must get a higher one.
        let holder = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral");
        let held = holder.local_addr().expect("addr").port();

        let chosen = first_free_port(held).expect("should find a port");
        assert!(chosen > held, "expected a port above {}, got {}", held, chosen);
    }

    #[test]
    fn first_free_port_returns_requested_when_free() {
        // Find a free port by binding and releasing it, then request it.
        let probe = TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral");
        let port = probe.local_addr().expect("addr").port();
        drop(probe);

        let chosen = first_free_port(port).expect("should find a port");
        assert_eq!(chosen, port);
    }
}
