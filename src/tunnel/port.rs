//! Local port selection for the forwarded end of a tunnel.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use crate::error::{AicliError, Result};

/// Pick the local port a tunnel will listen on.
///
/// `None` asks the OS for a free port. A fixed port is used if it is free,
/// otherwise the next free port above it within `span` is taken.
pub fn pick_local_port(requested: Option<u16>, span: u16) -> Result<u16> {
    match requested {
        None => {
            let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
            Ok(listener.local_addr()?.port())
        }
        Some(start) => {
            let end = start.saturating_add(span);
            (start..=end).find(|port| is_free(*port)).ok_or_else(|| {
                AicliError::tunnel_connect(format!("no free local port in {start}..={end}"))
            })
        }
    }
}

fn is_free(port: u16) -> bool {
    port != 0 && TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_returns_a_bindable_port() {
        let port = pick_local_port(None, 0).unwrap();
        assert!(port > 0);
        assert!(is_free(port));
    }

    #[test]
    fn occupied_fixed_port_moves_upward() {
        let taken = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let picked = pick_local_port(Some(port), 100).unwrap();
        assert!(picked > port);
        assert!(picked <= port.saturating_add(100));
    }

    #[test]
    fn exhausted_range_is_a_connect_error() {
        let taken = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = pick_local_port(Some(port), 0).unwrap_err();
        assert!(err.to_string().contains("no free local port"));
    }
}
