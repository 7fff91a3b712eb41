use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use crate::config::KeepAlive;

pub mod cancel;
pub mod discovery;
pub mod error;
pub mod starter;
pub mod wire;
pub mod worker;

pub use error::{Error, Fault};
pub use starter::{RoundSummary, Starter};
pub use worker::Worker;

/// Converts an IP address and port to a socket address.
fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

/// Turns on TCP keep-alive with the given timings, so a peer that vanished
/// without closing is reported as a socket error.
#[cfg(target_os = "linux")]
fn set_keepalive<S: std::os::fd::AsRawFd>(
    socket: &S,
    keepalive: &KeepAlive,
) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let secs = |d: std::time::Duration| {
        d.as_secs().clamp(1, i32::MAX as u64) as libc::c_int
    };
    let (idle, interval) = (secs(keepalive.idle), secs(keepalive.interval));
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval)?;
    setsockopt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPCNT,
        keepalive.probes.clamp(1, i32::MAX as u32) as libc::c_int,
    )?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_keepalive<S>(_socket: &S, _keepalive: &KeepAlive) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn setsockopt(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: value outlives the call and the length matches its type.
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
