use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, trace, warn};

use crate::config::KeepAlive;

use super::{
    error::Error,
    ip_addr_to_socket_addr, set_keepalive,
    wire::{Discovery, Record},
};

/// Largest datagram we bother reading; anything longer is foreign traffic.
const MAX_DATAGRAM: usize = 64;

/// The worker's end of discovery: a UDP socket waiting for the starter's
/// broadcast.
pub struct DiscoveryListener {
    socket: UdpSocket,
    magic: u32,
}

impl DiscoveryListener {
    pub async fn bind(port: u16, magic: u32) -> Result<Self, Error> {
        let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let socket = UdpSocket::bind(any)
            .await
            .map_err(Error::setup("discovery socket"))?;
        socket
            .set_broadcast(true)
            .map_err(Error::setup("discovery socket"))?;
        Ok(Self { socket, magic })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for a datagram carrying our magic and returns who sent it.
    /// Datagrams of the wrong size or with another magic are skipped.
    pub async fn wait_for_starter(&self) -> Result<SocketAddr, Error> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            debug!("waiting for discovery broadcast");
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match Discovery::from_bytes(&buf[..len]) {
                Some(Discovery { magic }) if magic == self.magic => {
                    debug!(%from, "received discovery broadcast");
                    return Ok(from);
                }
                other => {
                    trace!(%from, len, ?other, "ignoring foreign datagram")
                }
            }
        }
    }
}

/// Sends one discovery datagram to `broadcast_addr:port`.
pub async fn broadcast(
    broadcast_addr: Ipv4Addr,
    port: u16,
    magic: u32,
) -> Result<(), Error> {
    let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    let socket = UdpSocket::bind(any)
        .await
        .map_err(Error::setup("broadcast socket"))?;
    socket
        .set_broadcast(true)
        .map_err(Error::setup("broadcast socket"))?;
    let to = SocketAddrV4::new(broadcast_addr, port);
    debug!(%to, "broadcasting discovery");
    socket
        .send_to(&Discovery { magic }.to_bytes(), to)
        .await
        .map_err(Error::setup("broadcast"))?;
    Ok(())
}

/// Connects to the starter that sent a broadcast from `from`.
///
/// A connect that does not finish within `connect_timeout` is reported as
/// [`Error::ConnectTimedOut`], separately from a refused or failed connect.
pub async fn connect(
    from: SocketAddr,
    task_port: u16,
    connect_timeout: Duration,
    keepalive: &KeepAlive,
) -> Result<TcpStream, Error> {
    let addr = ip_addr_to_socket_addr(from.ip(), task_port);
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(Error::setup("task socket"))?;
    set_keepalive(&socket, keepalive)?;

    debug!(%addr, "connecting to starter");
    let started = Instant::now();
    let stream = match timeout(connect_timeout, socket.connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(Error::ConnectTimedOut(addr)),
    };
    debug!(%addr, elapsed = ?started.elapsed(), "connected to starter");
    Ok(stream)
}

/// Binds the starter's task listener on every interface.
pub fn listen(port: u16, backlog: usize) -> Result<TcpListener, Error> {
    let socket = TcpSocket::new_v4().map_err(Error::setup("task listener"))?;
    socket
        .set_reuseaddr(true)
        .map_err(Error::setup("task listener"))?;
    socket
        .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .map_err(Error::setup("task listener"))?;
    socket
        .listen(backlog.clamp(1, u32::MAX as usize) as u32)
        .map_err(Error::setup("task listener"))
}

/// Accepts up to `max` connections, giving up once `window` has passed in
/// total. Running out of time is not an error; the caller gets whoever made it.
pub async fn accept_workers(
    listener: &TcpListener,
    max: usize,
    window: Duration,
    keepalive: &KeepAlive,
) -> Result<Vec<(TcpStream, SocketAddr)>, Error> {
    let deadline = Instant::now() + window;
    let mut workers = Vec::new();
    while workers.len() < max {
        let accepted = timeout_at(deadline, listener.accept()).await;
        let (stream, addr) = match accepted {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                warn!("worker hung up during accept: {}", e);
                continue;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(accepted = workers.len(), "accept window closed");
                break;
            }
        };
        set_keepalive(&stream, keepalive)?;
        debug!(
            %addr,
            n = workers.len() + 1,
            remaining = ?deadline.saturating_duration_since(Instant::now()),
            "accepted worker"
        );
        workers.push((stream, addr));
    }
    Ok(workers)
}
