//! Command-line surface and configuration assembly.
//!
//! A JSON config file supplies defaults; flags override it. Service and
//! forward mappings are repeatable flags with compact `key=value` forms.

use clap::{ArgAction, Parser, ValueEnum};
use serlink_core::config::{Config, Role, ServiceTarget};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "serlink",
    version,
    about = "Bridge a PPP serial link to local TCP services"
)]
pub struct Args {
    /// Serial device, e.g. /dev/ttyUSB0. Falls back to the config file.
    pub device: Option<PathBuf>,

    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Enable RTS/CTS hardware flow control.
    #[arg(long)]
    pub flow_control: bool,

    /// Which end of the link this instance is.
    #[arg(long, value_enum)]
    pub role: Option<CliRole>,

    /// Our address on the link.
    #[arg(long)]
    pub local_ip: Option<Ipv4Addr>,

    /// The peer's address on the link.
    #[arg(long)]
    pub remote_ip: Option<Ipv4Addr>,

    /// Host mode: answer link port PORT with the service at HOST:PORT.
    /// Repeatable.
    #[arg(long = "service", value_name = "PORT=HOST:PORT")]
    pub services: Vec<String>,

    /// Client mode: forward 127.0.0.1:LOCAL to port REMOTE on the peer.
    /// Repeatable.
    #[arg(long = "forward", value_name = "LOCAL=REMOTE")]
    pub forwards: Vec<String>,

    /// Open service sockets through this SOCKS5 server.
    #[arg(long, value_name = "HOST:PORT")]
    pub socks5: Option<SocketAddr>,

    /// JSON configuration file. Flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// More logging; twice for trace output.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliRole {
    Host,
    Client,
}

/// Build the bridge configuration from the config file, if any, with CLI
/// overrides on top.
pub fn build_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|error| format!("cannot read {}: {error}", path.display()))?;
            serde_json::from_str(&text)
                .map_err(|error| format!("cannot parse {}: {error}", path.display()))?
        }
        None => Config::default(),
    };

    if let Some(role) = args.role {
        config.role = match role {
            CliRole::Host => Role::Host,
            CliRole::Client => Role::Client,
        };
        // Pick the conventional address pair unless explicitly overridden.
        if args.local_ip.is_none() && args.remote_ip.is_none() && args.config.is_none() {
            let (local, remote) = match config.role {
                Role::Host => (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)),
                Role::Client => (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)),
            };
            config.local_ip = local;
            config.remote_ip = remote;
        }
    }
    if let Some(device) = &args.device {
        config.serial.device = device.clone();
    }
    if let Some(baud) = args.baud {
        config.serial.baud = baud;
    }
    if args.flow_control {
        config.serial.flow_control = true;
    }
    if let Some(local_ip) = args.local_ip {
        config.local_ip = local_ip;
    }
    if let Some(remote_ip) = args.remote_ip {
        config.remote_ip = remote_ip;
    }
    if let Some(socks5) = args.socks5 {
        config.socks5 = Some(socks5);
    }

    for mapping in &args.services {
        let (port, target) = parse_service(mapping)?;
        config.services.insert(port, target);
    }
    for mapping in &args.forwards {
        let (local, remote) = parse_forward(mapping)?;
        config.forwards.insert(local, remote);
    }

    Ok(config)
}

/// `PORT=HOST:PORT`, e.g. `22=127.0.0.1:22`.
fn parse_service(mapping: &str) -> Result<(u16, ServiceTarget), String> {
    let bad = || format!("invalid service mapping '{mapping}', expected PORT=HOST:PORT");
    let (port, target) = mapping.split_once('=').ok_or_else(bad)?;
    let port: u16 = port.trim().parse().map_err(|_| bad())?;
    let (host, target_port) = target.rsplit_once(':').ok_or_else(bad)?;
    let target_port: u16 = target_port.trim().parse().map_err(|_| bad())?;
    if host.trim().is_empty() {
        return Err(bad());
    }
    Ok((
        port,
        ServiceTarget {
            host: host.trim().to_string(),
            port: target_port,
        },
    ))
}

/// `LOCAL=REMOTE`, e.g. `8022=22`.
fn parse_forward(mapping: &str) -> Result<(u16, u16), String> {
    let bad = || format!("invalid forward mapping '{mapping}', expected LOCAL=REMOTE");
    let (local, remote) = mapping.split_once('=').ok_or_else(bad)?;
    let local: u16 = local.trim().parse().map_err(|_| bad())?;
    let remote: u16 = remote.trim().parse().map_err(|_| bad())?;
    Ok((local, remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_mappings_parse() {
        let (port, target) = parse_service("22=127.0.0.1:2222").unwrap();
        assert_eq!(port, 22);
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 2222);

        let (_, target) = parse_service("80=web.internal:8080").unwrap();
        assert_eq!(target.host, "web.internal");

        assert!(parse_service("22").is_err());
        assert!(parse_service("22=nohost").is_err());
        assert!(parse_service("notaport=127.0.0.1:1").is_err());
    }

    #[test]
    fn forward_mappings_parse() {
        assert_eq!(parse_forward("8022=22").unwrap(), (8022, 22));
        assert!(parse_forward("8022").is_err());
        assert!(parse_forward("x=22").is_err());
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let args = Args::parse_from([
            "serlink",
            "/dev/ttyS1",
            "--baud",
            "57600",
            "--role",
            "client",
            "--forward",
            "8022=22",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.serial.device, PathBuf::from("/dev/ttyS1"));
        assert_eq!(config.serial.baud, 57600);
        assert_eq!(config.local_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.forwards.get(&8022), Some(&22));
    }

    #[test]
    fn config_file_json_round_trips() {
        let text = r#"{
            "role": "host",
            "serial": { "device": "/dev/ttyS9", "baud": 19200, "flow_control": true },
            "services": { "22": { "host": "127.0.0.1", "port": 22 } }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert_eq!(config.serial.baud, 19200);
        assert!(config.serial.flow_control);
        assert_eq!(config.services.get(&22).unwrap().port, 22);
        // Unspecified sections keep their defaults.
        assert_eq!(config.mru, 1500);
        assert_eq!(config.tcp.mss, 1460);
    }
}
