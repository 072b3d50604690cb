use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// First port in `start..=end` that binds on loopback and is not in
/// `reserved`. The listener is released right away, so another process can
/// still take the port before the isolate binds it.
pub fn find_free_port(start: u16, end: u16, reserved: &HashSet<u16>) -> Option<u16> {
    (start..=end)
        .filter(|port| *port != 0 && !reserved.contains(port))
        .find(|port| TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, *port))).is_ok())
}
