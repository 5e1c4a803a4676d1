//! Local port allocation for engine listeners and the control API

use crate::error::{Result, SieveError};
use std::net::{Ipv4Addr, TcpListener};

/// First port scanned for per-node listeners
pub const LISTENER_PORT_BASE: u16 = 20000;

/// First port scanned for the engine control API
pub const API_PORT_BASE: u16 = 19000;

/// Find `count` free ports on 127.0.0.1, scanning upward from `start`.
///
/// Ports in `skip` are never returned. The scan is stateless: a port is free
/// if it can be bound right now, and it is released again immediately.
pub fn allocate(count: usize, start: u16, skip: &[u16]) -> Result<Vec<u16>> {
    let mut ports = Vec::with_capacity(count);
    if count == 0 {
        return Ok(ports);
    }

    for port in start..u16::MAX {
        if skip.contains(&port) {
            continue;
        }
        if is_free(port) {
            ports.push(port);
            if ports.len() == count {
                return Ok(ports);
            }
        }
    }

    Err(SieveError::PortExhausted {
        found: ports.len(),
        wanted: count,
    })
}

fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
