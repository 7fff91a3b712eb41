use std::{net::Ipv4Addr, time::Duration};

use typed_builder::TypedBuilder;

use crate::cluster::executor::Integrand;

pub const DISCOVERY_PORT: u16 = 4010;
pub const TASK_PORT: u16 = 4011;
/// "QUAD"
pub const DISCOVERY_MAGIC: u32 = 0x5155_4144;
pub const MAX_WORKERS: usize = 64;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const ACCEPT_WINDOW: Duration = Duration::from_secs(1);

/// TCP keep-alive tuning applied to every task connection. With the defaults a
/// silent peer is noticed about two seconds after the link goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct KeepAlive {
    #[builder(default = Duration::from_secs(1))]
    pub idle: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub interval: Duration,
    #[builder(default = 1)]
    pub probes: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Deployment settings shared by the starter and the workers.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterConfig {
    #[builder(default = DISCOVERY_PORT)]
    pub discovery_port: u16,
    #[builder(default = TASK_PORT)]
    pub task_port: u16,
    #[builder(default = DISCOVERY_MAGIC)]
    pub magic: u32,
    /// Where the starter sends its discovery datagram.
    #[builder(default = Ipv4Addr::BROADCAST)]
    pub broadcast_addr: Ipv4Addr,
    #[builder(default = MAX_WORKERS)]
    pub max_workers: usize,
    #[builder(default = CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    /// Total time the starter spends accepting workers after a broadcast.
    #[builder(default = ACCEPT_WINDOW)]
    pub accept_window: Duration,
    #[builder(default)]
    pub keepalive: KeepAlive,
    /// Hard bound on a worker waiting for its task after connecting. `None`
    /// leaves it to keep-alive.
    #[builder(default, setter(strip_option))]
    pub task_timeout: Option<Duration>,
    #[builder(default)]
    pub integrand: Integrand,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
