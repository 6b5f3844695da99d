//! The configuration record consumed by the core.
//!
//! The bridge takes a fully-formed [`Config`]; assembling one from a file or
//! command line is the caller's job. All fields have defaults matching the
//! conventional deployment: host side at 10.0.0.1, client at 10.0.0.2,
//! 115200 baud.

use serde::Deserialize;
use std::{
    collections::BTreeMap, net::Ipv4Addr, net::SocketAddr, path::PathBuf, time::Duration,
};

/// Which end of the point-to-point link this instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Waits for the peer to start negotiation and answers SYNs on the
    /// configured service ports, forwarding inward to local services.
    Host,
    /// Initiates negotiation and opens local listening ports that tunnel
    /// outbound through the link.
    Client,
}

/// Where a service port on the link is actually answered.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceTarget {
    pub host: String,
    pub port: u16,
}

/// The serial endpoint. The core never opens the device itself; the caller
/// does and hands the bridge a byte duplex, but the settings travel with the
/// rest of the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: PathBuf,
    pub baud: u32,
    /// RTS/CTS hardware flow control.
    pub flow_control: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyUSB0"),
            baud: 115_200,
            flow_control: false,
        }
    }
}

/// Tuning knobs for the TCP machinery. The defaults are the values the stack
/// was validated with; they rarely need changing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpTuning {
    /// Largest TCP payload we advertise and send.
    pub mss: u16,
    /// Initial slow start threshold in bytes.
    pub ssthresh: u32,
    /// Initial congestion window in bytes. Defaults to one MSS.
    pub initial_cwnd: Option<u32>,
    /// Consecutive retransmission timeouts before a flow is aborted.
    pub max_retransmits: u32,
    /// How long a connection lingers in TIME-WAIT (2·MSL).
    pub time_wait: Duration,
    /// How long a service socket open may take before the flow is reset.
    pub connect_timeout: Duration,
}

impl Default for TcpTuning {
    fn default() -> Self {
        Self {
            mss: 1460,
            ssthresh: 64 * 1024,
            initial_cwnd: None,
            max_retransmits: 6,
            time_wait: Duration::from_secs(240),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// The complete configuration surface of the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub role: Role,
    pub serial: SerialConfig,
    /// Our address on the link.
    pub local_ip: Ipv4Addr,
    /// The peer's address on the link.
    pub remote_ip: Ipv4Addr,
    /// Maximum receive unit offered during LCP negotiation.
    pub mru: u16,
    /// LCP magic number. Drawn at random when unset.
    pub magic_number: Option<u32>,
    /// Cadence of LCP Echo-Request keepalives once the link is open.
    pub echo_interval: Duration,
    /// How long to wait before re-sending an unanswered Configure-Request.
    pub restart_timer: Duration,
    /// Configure-Request attempts before the link is declared dead.
    pub max_configure: u32,
    pub tcp: TcpTuning,
    /// Host mode: link-side destination port to the service that answers it.
    pub services: BTreeMap<u16, ServiceTarget>,
    /// Client mode: local listening port to service port on the remote.
    pub forwards: BTreeMap<u16, u16>,
    /// When set, service sockets are opened through this SOCKS5 server.
    pub socks5: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Host,
            serial: SerialConfig::default(),
            local_ip: Ipv4Addr::new(10, 0, 0, 1),
            remote_ip: Ipv4Addr::new(10, 0, 0, 2),
            mru: 1500,
            magic_number: None,
            echo_interval: Duration::from_secs(30),
            restart_timer: Duration::from_secs(3),
            max_configure: 10,
            tcp: TcpTuning::default(),
            services: BTreeMap::new(),
            forwards: BTreeMap::new(),
            socks5: None,
        }
    }
}

impl Config {
    /// A host-side configuration with the conventional addresses.
    pub fn host() -> Self {
        Self::default()
    }

    /// A client-side configuration with the conventional addresses.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            local_ip: Ipv4Addr::new(10, 0, 0, 2),
            remote_ip: Ipv4Addr::new(10, 0, 0, 1),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_link_conventions() {
        let config = Config::host();
        assert_eq!(config.local_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.remote_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.mru, 1500);
        assert_eq!(config.tcp.mss, 1460);
        assert_eq!(config.tcp.max_retransmits, 6);
        assert_eq!(config.tcp.time_wait, Duration::from_secs(240));
    }

    #[test]
    fn client_swaps_addresses() {
        let config = Config::client();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.local_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.remote_ip, Ipv4Addr::new(10, 0, 0, 1));
    }
}
