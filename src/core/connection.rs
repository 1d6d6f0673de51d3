/// TCP plumbing shared by client sessions and backend connections
///
/// The buffer operations are synchronous and non-blocking; the helpers here
/// wrap them in readiness loops so tasks only suspend while a socket has
/// nothing to offer.
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{Buffer, Progress};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const LISTEN_BACKLOG: i32 = 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Bind the shared listening socket. Workers each register a clone of it
/// with their own runtime.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Low latency plus kernel keepalive on every proxied socket
pub fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let socket = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive: {}", e);
    }
}

/// Open a backend socket, giving up after `limit`
pub async fn connect(addr: &str, limit: Duration) -> ProxyResult<TcpStream> {
    debug!("Connecting to backend {}", addr);
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            configure_stream(&stream);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProxyError::timeout(format!("connect to {}", addr))),
    }
}

/// Accumulate one complete packet into `buf`
pub async fn read_packet(stream: &TcpStream, buf: &mut Buffer) -> ProxyResult<()> {
    loop {
        match buf.read_packet(stream)? {
            Progress::Done => return Ok(()),
            Progress::Pending => stream.readable().await?,
        }
    }
}

/// Read at least one byte of whatever the peer sent
pub async fn read_available(stream: &TcpStream, buf: &mut Buffer) -> ProxyResult<()> {
    loop {
        match buf.read_available(stream)? {
            Progress::Done => return Ok(()),
            Progress::Pending => stream.readable().await?,
        }
    }
}

/// Drain `buf` from its cursor
pub async fn write_buffer(stream: &TcpStream, buf: &mut Buffer) -> ProxyResult<()> {
    loop {
        match buf.write(stream)? {
            Progress::Done => return Ok(()),
            Progress::Pending => stream.writable().await?,
        }
    }
}

/// Frame `payload` with `seq` and write it out
pub async fn send_packet(stream: &TcpStream, buf: &mut Buffer, seq: u8, payload: &[u8]) -> ProxyResult<()> {
    buf.load_packet(seq, payload)?;
    write_buffer(stream, buf).await
}

/// Nothing is waiting to be read and the peer is still there
pub fn is_quiet(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    matches!(stream.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
}

/// Wait for the peer to send anything at all. Resolves with the error that
/// ends the session: stray bytes are a protocol violation, EOF a close.
pub async fn interrupted(stream: &TcpStream) -> ProxyError {
    let mut probe = [0u8; 1];
    loop {
        if let Err(e) = stream.readable().await {
            return e.into();
        }
        match stream.try_read(&mut probe) {
            Ok(0) => return ProxyError::PeerClosed,
            Ok(_) => return ProxyError::protocol("client sent data while a command was in flight"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return e.into(),
        }
    }
}

/// Send one packet and read the single-packet reply into `buf`
pub async fn exchange(stream: &TcpStream, buf: &mut Buffer, seq: u8, payload: &[u8]) -> ProxyResult<()> {
    send_packet(stream, buf, seq, payload).await?;
    buf.reset();
    read_packet(stream, buf).await
}
