//! Command line interface for the `tensor-query` server binary.
//!
//! The listen and streaming fields of [`ServerSrcConfig`] have flags; `--caps`
//! sets the format the attached sink accepts. Discovery needs a
//! [`Broker`](tensor_query::Broker) client, which the binary does not ship, so
//! it has no discovery flags.

#[cfg(feature = "metrics")]
use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tensor_query::{Caps, ConfigError, Protocol, ServerSrcConfig};

/// Command line arguments for the `tensor-query` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tensor-query",
    version,
    about = "Receive tensor frames from query clients"
)]
pub struct Cli {
    /// Host to listen on.
    #[arg(long, default_value = tensor_query::config::DEFAULT_HOST)]
    pub host: String,
    /// Port to listen on; 0 picks a free port.
    #[arg(short, long, default_value_t = tensor_query::config::DEFAULT_PORT)]
    pub port: u16,
    /// Wire protocol (tcp, mqtt, hybrid, custom).
    #[arg(long, default_value_t = Protocol::Tcp)]
    pub protocol: Protocol,
    /// Idle connection timeout in seconds; 0 disables it.
    #[arg(long, default_value_t = tensor_query::config::DEFAULT_TIMEOUT_SECS)]
    pub timeout: u32,
    /// Server instance id.
    #[arg(long, default_value_t = tensor_query::config::DEFAULT_SERVER_ID)]
    pub id: u32,
    /// Stamp frames with their running time.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub is_live: bool,
    /// Seconds to wait for the sink to attach.
    #[arg(long, default_value_t = 10)]
    pub ready_timeout: u64,
    /// Caps accepted by the sink.
    #[arg(long, default_value = "ANY")]
    pub caps: Caps,
    /// Do not log each received frame.
    #[arg(long)]
    pub silent: bool,
    /// Serve Prometheus metrics on this address.
    #[cfg(feature = "metrics")]
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Build the source configuration from the parsed flags.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a flag value is rejected.
    pub fn to_config(&self) -> Result<ServerSrcConfig, ConfigError> {
        let mut config = ServerSrcConfig::new(self.host.clone(), self.port)?;
        config.set_protocol(self.protocol);
        config.set_timeout_secs(self.timeout)?;
        config.set_id(self.id);
        config.set_live(self.is_live);
        config.set_ready_timeout(Duration::from_secs(self.ready_timeout));
        Ok(config)
    }
}
