//! Where the daemon listens and how long peers wait for each other.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 3449;

/// Environment variable naming the daemon host
pub const ADDRESS_ENV: &str = "BUFFERD_DAEMON_ADDRESS";

/// Environment variable naming the daemon port
pub const PORT_ENV: &str = "BUFFERD_DAEMON_PORT";

/// How long a caller waits for the answer to its request.
pub const DAEMON_ANSWER_TIMEOUT: Duration = Duration::from_millis(2500);

/// How long the receiver waits for a caller to take an answer.
pub const CLIENT_READY_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause between sending `disconnect` and closing the socket.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicationSettings {
    pub host: IpAddr,
    pub port: u16,
    pub answer_timeout: Duration,
    pub client_ready_timeout: Duration,
    pub disconnect_grace: Duration,
}

impl Default for CommunicationSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            answer_timeout: DAEMON_ANSWER_TIMEOUT,
            client_ready_timeout: CLIENT_READY_TIMEOUT,
            disconnect_grace: DISCONNECT_GRACE,
        }
    }
}

impl CommunicationSettings {
    /// Settings from [`ADDRESS_ENV`] and [`PORT_ENV`], falling back to the
    /// loopback address and [`DEFAULT_PORT`].
    #[must_use]
    pub fn from_env() -> Self {
        let settings = Self {
            host: host_from(std::env::var(ADDRESS_ENV).ok().as_deref()),
            port: port_from(std::env::var(PORT_ENV).ok().as_deref()),
            ..Self::default()
        };
        debug!("Daemon endpoint is {}", settings.socket_addr());
        settings
    }

    /// Default timeouts with an explicit daemon address.
    #[must_use]
    pub fn with_address(address: SocketAddr) -> Self {
        Self {
            host: address.ip(),
            port: address.port(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn host_from(value: Option<&str>) -> IpAddr {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Some(name) = value.map(str::trim).filter(|name| !name.is_empty()) else {
        return loopback;
    };

    if let Ok(ip) = name.parse::<IpAddr>() {
        return ip;
    }

    match (name, 0).to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                return addr.ip();
            }
            warn!("Host '{}' has no address, using {}", name, loopback);
            loopback
        }
        Err(e) => {
            warn!("Host '{}' is not known ({}), using {}", name, e, loopback);
            loopback
        }
    }
}

fn port_from(value: Option<&str>) -> u16 {
    let Some(text) = value else {
        return DEFAULT_PORT;
    };

    match text.trim().parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            warn!(
                "'{}' is not a valid port number, using {}",
                text, DEFAULT_PORT
            );
            DEFAULT_PORT
        }
    }
}
