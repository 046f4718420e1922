use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use netpace_lib::config::SupervisorConfig;
use netpace_lib::LaneBuilder;
use serde::Deserialize;
use url::Url;

use crate::verbosity::Verbosity;

pub(crate) const NETPACE_CONFIG_FILE: &str = "netpace.toml";

// clap wants `&str` defaults, keep in sync with `NETPACE_CONFIG_FILE`
const HELP_MSG_CONFIG_FILE: &str = "Configuration file to use\n\n[default: netpace.toml]";

/// Throttled HTTP polling and supervised WebSocket connections
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct NetpaceOptions {
    #[arg(short, long = "config", global = true, help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) verbose: Verbosity,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Send GET requests through a throttled dispatcher
    Poll(PollArgs),
    /// Keep WebSocket connections open and print what they receive
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct PollArgs {
    /// URLs to request
    #[arg(required = true)]
    pub(crate) urls: Vec<Url>,

    /// Minimum time between two requests on the same lane, e.g. `500ms`
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub(crate) interval: Option<Duration>,

    /// Maximum number of requests waiting for a lane
    #[arg(long)]
    pub(crate) capacity: Option<usize>,

    /// Number of unbound lanes. Ignored if `--bind` is given.
    #[arg(long)]
    pub(crate) lanes: Option<usize>,

    /// Request all URLs again every interval until interrupted
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) repeat: Option<Duration>,

    /// Local address to send from. Pass several times for one lane per
    /// address.
    #[arg(long)]
    pub(crate) bind: Vec<IpAddr>,
}

#[derive(Args, Debug, Clone, Default)]
pub(crate) struct WatchArgs {
    /// `ws://` or `wss://` URLs to connect to
    #[arg(required = true)]
    pub(crate) urls: Vec<String>,

    /// Local address to connect from. Pass several times to spread
    /// connections over addresses.
    #[arg(long)]
    pub(crate) bind: Vec<IpAddr>,

    /// Time between two heartbeats
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) heartbeat: Option<Duration>,

    /// Reconnect after this long without inbound messages. `0s` disables the
    /// check.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) max_inactive: Option<Duration>,

    /// Reconnect after a connection has been up this long
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) reconnect: Option<Duration>,

    /// Minimum time between two outbound messages
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) send_interval: Option<Duration>,

    /// Text message sent as heartbeat
    #[arg(long)]
    pub(crate) ping: Option<String>,

    /// Stop a connection after its first failed connection attempt instead
    /// of retrying
    #[arg(long)]
    pub(crate) give_up: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub(crate) insecure: bool,
}

/// Values read from the configuration file. Command line flags take
/// precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// Minimum time between two requests on the same lane
    #[serde(with = "humantime_serde")]
    pub(crate) interval: Option<Duration>,

    /// Maximum number of requests waiting for a lane
    pub(crate) capacity: Option<usize>,

    /// Number of unbound lanes
    pub(crate) lanes: Option<usize>,

    /// Repeat interval of `poll`
    #[serde(with = "humantime_serde")]
    pub(crate) repeat: Option<Duration>,

    /// Template for every lane
    pub(crate) lane: LaneBuilder,

    /// Settings of the `watch` supervisors
    pub(crate) supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from a file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }
}
