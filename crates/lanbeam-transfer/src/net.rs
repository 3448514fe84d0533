//! Socket setup shared by both engines.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{Result, TransferError};

/// Listen on all interfaces. `SO_REUSEADDR` lets the next session rebind the
/// well-known port while the previous connection sits in TIME_WAIT.
pub fn bind_listener(port: u16, buffer_size: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    // inherited by the accepted connection
    let _ = socket.set_recv_buffer_size(buffer_size);
    let _ = socket.set_send_buffer_size(buffer_size);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(socket.into())
}

/// Disable Nagle and enlarge kernel buffers. Failures only cost throughput.
pub fn tune_stream(stream: &TcpStream, buffer_size: usize) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }
    if let Err(e) = sock.set_send_buffer_size(buffer_size) {
        tracing::debug!("set_send_buffer_size failed: {}", e);
    }
    if let Err(e) = sock.set_recv_buffer_size(buffer_size) {
        tracing::debug!("set_recv_buffer_size failed: {}", e);
    }
}

/// Apply read/write timeouts; every blocking socket call is bounded by these.
pub fn set_timeouts(stream: &TcpStream, read: Duration, write: Duration) -> Result<()> {
    stream
        .set_read_timeout(Some(read))
        .map_err(|e| TransferError::io("set read timeout", e))?;
    stream
        .set_write_timeout(Some(write))
        .map_err(|e| TransferError::io("set write timeout", e))?;
    Ok(())
}

/// Resolve user input: `host` (with `default_port`) or `host:port`.
pub fn resolve_peer(address: &str, default_port: u16) -> Result<SocketAddr> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransferError::InvalidInput("peer address is empty".into()));
    }
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let resolved = if address.contains(':') {
        address.to_socket_addrs()
    } else {
        (address, default_port).to_socket_addrs()
    };
    resolved
        .map_err(|e| TransferError::ConnectFailed {
            addr: address.to_string(),
            source: e,
        })?
        .next()
        .ok_or_else(|| TransferError::InvalidInput(format!("{address} did not resolve")))
}

/// Connect with a bounded wait.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    TcpStream::connect_timeout(&addr, timeout).map_err(|e| TransferError::ConnectFailed {
        addr: addr.to_string(),
        source: e,
    })
}

/// This device's LAN address, for display next to the security code.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which local
/// address would route to a public destination.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
