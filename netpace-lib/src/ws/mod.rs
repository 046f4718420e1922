//! Supervised WebSocket connections.
//!
//! A [`Connection`] is configured with a [`ConnectionBuilder`] and handed to
//! a [`Supervisor`], which opens it, sends heartbeats, drops it when it went
//! quiet and opens it again. A [`SupervisorGroup`] spreads connections over
//! several local addresses.

mod builder;
mod channel;
mod connection;
mod group;
mod pacer;
mod supervised;
mod supervisor;

pub use builder::{
    ConnectErrorHook, ConnectedHook, ConnectionBuilder, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_INACTIVE_TIME, DisconnectedHook, FrameHook, HeartbeatHook, StartingHook,
};
pub use channel::Channel;
pub use connection::{Connection, WeakConnection};
pub use group::SupervisorGroup;
pub use pacer::{Outbound, SendOutcome};
pub use supervised::Supervised;
pub use supervisor::Supervisor;
pub use tokio_tungstenite::tungstenite::Message;

/// Poll `condition` until it holds, failing the test after five seconds
#[cfg(test)]
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    use std::time::Duration;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within five seconds");
}
