use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

/// TLS material handed to the transport library.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    ///
    /// TLS certificate chain file (PEM)
    ///
    pub certificate_chain: String,
    ///
    /// TLS private key file (PEM)
    ///
    pub private_key: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// bind address
    ///
    /// The address every socket of the pool binds to. The binding address
    /// supports ipv4 and ipv6.
    ///
    #[serde(default = "Server::host")]
    pub host: IpAddr,
    ///
    /// bind port
    ///
    /// Port 0 lets the kernel pick one; the whole pool shares whatever the
    /// first socket was given.
    ///
    #[serde(default = "Server::port")]
    pub port: u16,
    ///
    /// Number of UDP sockets (and senders) reading from the bind address.
    ///
    #[serde(default = "Server::socket_pool_size")]
    pub socket_pool_size: usize,
    ///
    /// Number of dispatcher workers packets are sharded across.
    ///
    #[serde(default = "Server::dispatcher_pool_size")]
    pub dispatcher_pool_size: usize,
    ///
    /// Maximum datagrams a socket reader takes per poll window.
    ///
    #[serde(default = "Server::socket_event_capacity")]
    pub socket_event_capacity: usize,
    ///
    /// Poll window of a socket reader, in milliseconds.
    ///
    #[serde(default = "Server::socket_polling_timeout")]
    pub socket_polling_timeout: u64,
    ///
    /// Keep an address to connection-id side table so packets from a peer
    /// that changed its connection id path can still be traced.
    ///
    #[serde(default)]
    pub allow_address_routing: bool,
}

impl Server {
    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Server {
    fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn port() -> u16 {
        4433
    }

    fn socket_pool_size() -> usize {
        num_cpus::get()
    }

    fn dispatcher_pool_size() -> usize {
        num_cpus::get()
    }

    fn socket_event_capacity() -> usize {
        1024
    }

    fn socket_polling_timeout() -> u64 {
        100
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
            socket_pool_size: Self::socket_pool_size(),
            dispatcher_pool_size: Self::dispatcher_pool_size(),
            socket_event_capacity: Self::socket_event_capacity(),
            socket_polling_timeout: Self::socket_polling_timeout(),
            allow_address_routing: false,
        }
    }
}

/// QUIC transport parameters applied to every accepted connection.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Transport {
    #[serde(default = "Transport::initial_max_data")]
    pub initial_max_data: u64,
    #[serde(default = "Transport::max_udp_payload_size")]
    pub max_udp_payload_size: usize,
    #[serde(default = "Transport::initial_max_stream_data")]
    pub initial_max_stream_data_bidi_local: u64,
    #[serde(default = "Transport::initial_max_stream_data")]
    pub initial_max_stream_data_bidi_remote: u64,
    #[serde(default = "Transport::initial_max_stream_data")]
    pub initial_max_stream_data_uni: u64,
    #[serde(default = "Transport::initial_max_streams")]
    pub initial_max_streams_bidi: u64,
    #[serde(default = "Transport::initial_max_streams")]
    pub initial_max_streams_uni: u64,
    ///
    /// Idle timeout, in milliseconds.
    ///
    /// If no packet is received within this window the connection is closed
    /// to prevent resources from being occupied indefinitely.
    ///
    #[serde(default = "Transport::max_idle_timeout")]
    pub max_idle_timeout: u64,
    #[serde(default = "Transport::disable_active_migration")]
    pub disable_active_migration: bool,
    #[serde(default = "Transport::enable_early_data")]
    pub enable_early_data: bool,
    #[serde(default = "Transport::enable_dgram")]
    pub enable_dgram: bool,
}

impl Transport {
    fn initial_max_data() -> u64 {
        10_000_000
    }

    fn max_udp_payload_size() -> usize {
        1350
    }

    fn initial_max_stream_data() -> u64 {
        1_000_000
    }

    fn initial_max_streams() -> u64 {
        100
    }

    fn max_idle_timeout() -> u64 {
        30_000
    }

    fn disable_active_migration() -> bool {
        true
    }

    fn enable_early_data() -> bool {
        true
    }

    fn enable_dgram() -> bool {
        true
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            initial_max_data: Self::initial_max_data(),
            max_udp_payload_size: Self::max_udp_payload_size(),
            initial_max_stream_data_bidi_local: Self::initial_max_stream_data(),
            initial_max_stream_data_bidi_remote: Self::initial_max_stream_data(),
            initial_max_stream_data_uni: Self::initial_max_stream_data(),
            initial_max_streams_bidi: Self::initial_max_streams(),
            initial_max_streams_uni: Self::initial_max_streams(),
            max_idle_timeout: Self::max_idle_timeout(),
            disable_active_migration: Self::disable_active_migration(),
            enable_early_data: Self::enable_early_data(),
            enable_dgram: Self::enable_dgram(),
        }
    }
}

/// Process-wide keyed-PRF secrets.
///
/// Both must be at least 32 bytes. When left unset an ephemeral secret is
/// generated at startup, which means address-validation tokens and derived
/// connection ids do not survive a restart.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Secrets {
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub connection_id_secret: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub tls: Option<Tls>,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: webtransport-server --config /etc/webtransport/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
