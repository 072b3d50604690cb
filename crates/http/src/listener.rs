use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Socket, Type};

/// Binds a listener that shares `addr` with its siblings through
/// `SO_REUSEPORT`, letting the kernel spread connections across them.
pub fn bind_reuseport(addr: SocketAddr) -> io::Result<tokio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .map_err(|err| context("socket create failed", err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| context("set_reuse_address failed", err))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|err| context("set_reuse_port failed", err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| context("bind failed", err))?;
    socket.listen(1024).map_err(|err| context("listen failed", err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| context("set_nonblocking failed", err))?;
    let listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(listener)
}

fn context(what: &str, err: io::Error) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {}", what, err))
}
