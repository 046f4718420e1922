use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Default minimum spacing between two dispatches on the same lane
const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of operations waiting for a lane
const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Default period of a repeat scheduler
const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default spacing between two reconnects of one supervisor
const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Default interval between two heartbeats of a connection
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default period of the supervision loop
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Pacing of a [`ThrottledDispatcher`](crate::ThrottledDispatcher)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Minimum spacing between two dispatches on the same lane.
    /// Zero disables throttling.
    #[serde(default = "default_dispatch_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum number of waiting operations
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: default_dispatch_interval(),
            capacity: default_queue_capacity(),
        }
    }
}

impl DispatcherConfig {
    /// Create a `DispatcherConfig` from CLI options, using defaults for missing values
    #[must_use]
    pub fn from_options(interval: Option<Duration>, capacity: Option<usize>) -> Self {
        Self {
            interval: interval.unwrap_or(DEFAULT_DISPATCH_INTERVAL),
            capacity: capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
        }
    }
}

/// Period of a [`RepeatScheduler`](crate::RepeatScheduler)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeatConfig {
    /// Target time from the start of one round to the start of the next
    #[serde(default = "default_repeat_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            interval: default_repeat_interval(),
        }
    }
}

/// Timing and placement of connection supervisors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Minimum spacing between two reconnects of one supervisor
    #[serde(default = "default_connect_interval", with = "humantime_serde")]
    pub connect_interval: Duration,

    /// Interval between two heartbeats of a connection
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Period of the supervision loop
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Local addresses, one supervisor each.
    /// Empty means a single supervisor on the default route.
    #[serde(default)]
    pub bind_ips: Vec<IpAddr>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_interval: default_connect_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            check_interval: default_check_interval(),
            bind_ips: Vec::new(),
        }
    }
}

const fn default_dispatch_interval() -> Duration {
    DEFAULT_DISPATCH_INTERVAL
}

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

const fn default_repeat_interval() -> Duration {
    DEFAULT_REPEAT_INTERVAL
}

const fn default_connect_interval() -> Duration {
    DEFAULT_CONNECT_INTERVAL
}

const fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

const fn default_check_interval() -> Duration {
    DEFAULT_CHECK_INTERVAL
}
