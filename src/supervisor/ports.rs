//! Free-port discovery for services configured with a port range.

use crate::errors::SupervisorError;
use std::net::TcpListener;

/// Check whether `port` can currently be bound on the loopback interface.
///
/// The probe socket is dropped immediately, so this is best-effort: another
/// process could grab the port before the service does. The consumer is
/// expected to bind promptly after allocation.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Scan `[start, end]` in increasing order and return the first bindable
/// port.
pub fn find_free_port(start: u16, end: u16) -> Result<u16, SupervisorError> {
    for port in start..=end {
        if is_port_available(port) {
            return Ok(port);
        }
    }
    Err(SupervisorError::PortExhausted { start, end })
}
