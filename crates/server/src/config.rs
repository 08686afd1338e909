//! Command-line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::channel::ChannelSettings;
use crate::dispatcher::DispatchSettings;

/// Colony relay server
#[derive(Debug, Clone, Parser)]
#[command(name = "colony", version, about)]
pub struct Config {
    /// Address both listeners bind to
    #[arg(long, env = "COLONY_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port for the HTTP API used by the bridge
    #[arg(long, env = "COLONY_HTTP_PORT", default_value_t = 3000)]
    pub http_port: u16,

    /// Port for the persistent observer channel
    #[arg(long, env = "COLONY_CHANNEL_PORT", default_value_t = 3001)]
    pub channel_port: u16,

    /// Name reported in colony snapshots
    #[arg(long, env = "COLONY_NAME", default_value = "Genesis")]
    pub colony_name: String,

    /// Seconds without a report before a turtle is marked offline
    #[arg(long, env = "COLONY_STALE_AFTER_SECS", default_value_t = 60)]
    pub stale_after_secs: u64,

    /// Seconds between staleness sweeps
    #[arg(long, env = "COLONY_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Requeue commands that stay `sent` without a result for this long.
    /// Unset means a polled command is never redelivered.
    #[arg(long, env = "COLONY_COMMAND_LEASE_SECS")]
    pub command_lease_secs: Option<u64>,

    /// Largest inbound frame payload accepted on the channel
    #[arg(long, env = "COLONY_MAX_FRAME_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_frame_bytes: usize,

    /// Frames buffered per channel before broadcasts to it are dropped
    #[arg(long, env = "COLONY_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Write logs to `colony.log` in this directory instead of stdout
    #[arg(long, env = "COLONY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.http_port)
    }

    pub fn channel_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.channel_port)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            colony_name: self.colony_name.clone(),
            stale_after: Duration::from_secs(self.stale_after_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            command_lease: self.command_lease_secs.map(Duration::from_secs),
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            max_frame_bytes: self.max_frame_bytes,
            outbound_buffer: self.outbound_buffer.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_ports() {
        let config = Config::parse_from(["colony"]);
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.channel_port, 3001);
        assert_eq!(config.colony_name, "Genesis");
        assert!(config.command_lease_secs.is_none());

        let settings = config.dispatch_settings();
        assert_eq!(settings.stale_after, Duration::from_secs(60));
        assert_eq!(settings.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from([
            "colony",
            "--channel-port",
            "9001",
            "--command-lease-secs",
            "15",
            "--bind",
            "127.0.0.1",
        ]);
        assert_eq!(config.channel_addr(), "127.0.0.1:9001".parse().unwrap());
        assert_eq!(
            config.dispatch_settings().command_lease,
            Some(Duration::from_secs(15))
        );
    }
}
