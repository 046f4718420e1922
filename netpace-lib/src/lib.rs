//! `netpace` paces outbound network traffic and keeps long-lived
//! connections alive.
//!
//! HTTP requests are described by an [`Operation`] and submitted to a
//! [`Requester`]. A [`Lane`] executes them over one HTTP client; a
//! [`ThrottledDispatcher`] queues them and spreads them over several lanes,
//! at most one request per lane and interval:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use netpace_lib::{LaneBuilder, Operation, Requester, Result, ThrottledDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let lanes = vec![LaneBuilder::default().lane()?];
//!   let dispatcher = ThrottledDispatcher::new(lanes, Duration::from_secs(1), 16)?;
//!
//!   let url = "https://example.com".try_into().unwrap();
//!   if let Some(result) = dispatcher.request(Operation::get(url)) {
//!     let reply = result.wait().await?;
//!     println!("{}", reply.status);
//!   }
//!   Ok(())
//! }
//! ```
//!
//! A [`RepeatScheduler`] resubmits a fixed list of operations every
//! interval. WebSocket connections live in the [`ws`] module.
#![allow(clippy::module_name_repetitions)]

mod deferred;
mod dispatcher;
mod lane;
mod ratelimit;
mod repeat;
mod requester;
mod types;

pub mod config;
pub mod ws;

pub use deferred::{CancelAction, DeferredResult, TransportHandle};
pub use dispatcher::ThrottledDispatcher;
pub use lane::{DEFAULT_MAX_REDIRECTS, DEFAULT_USER_AGENT, Lane, LaneBuilder};
pub use repeat::RepeatScheduler;
pub use requester::Requester;
pub use types::*;
