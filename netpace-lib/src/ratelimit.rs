//! Per-lane rate limiting for the [`ThrottledDispatcher`](crate::ThrottledDispatcher).
//!
//! Every lane gets its own [`governor`] limiter with a quota of one
//! dispatch per interval and no burst. The limiters run on tokio's clock, so
//! they follow a paused or advanced test clock like the rest of the
//! scheduler.

use std::num::NonZeroU32;
use std::ops::Add;
use std::time::Duration;

use governor::clock::{Clock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::time::Instant;

/// [`governor`] clock reading [`tokio::time::Instant`]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TokioClock;

/// Point in time of a [`TokioClock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = Self;

    fn add(self, other: Nanos) -> Self {
        Self(self.0 + Duration::from(other))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        self.0.saturating_duration_since(earlier.0).into()
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        self.0.checked_sub(duration.into()).map_or(*self, Self)
    }
}

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> Self::Instant {
        TokioInstant(Instant::now())
    }
}

type LaneLimiter = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

/// One limiter per lane, or none at all if throttling is disabled
pub(crate) struct LaneLimits {
    limiters: Vec<Option<LaneLimiter>>,
    clock: TokioClock,
}

impl LaneLimits {
    /// Allow one dispatch per `interval` on each of `lanes` lanes.
    /// A zero interval disables throttling.
    pub(crate) fn new(lanes: usize, interval: Duration) -> Self {
        let clock = TokioClock;
        let quota = Quota::with_period(interval).map(|quota| quota.allow_burst(NonZeroU32::MIN));
        let limiters = (0..lanes)
            .map(|_| quota.map(|quota| RateLimiter::direct_with_clock(quota, clock)))
            .collect();
        Self { limiters, clock }
    }

    /// Claim the first lane, in configuration order, which may dispatch now.
    ///
    /// Otherwise returns how long it takes until the earliest lane becomes
    /// available again. Nothing is claimed in that case.
    pub(crate) fn acquire(&self) -> Result<usize, Duration> {
        let mut shortest: Option<Duration> = None;
        for (index, limiter) in self.limiters.iter().enumerate() {
            let Some(limiter) = limiter else {
                return Ok(index);
            };
            match limiter.check() {
                Ok(()) => return Ok(index),
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    shortest = Some(shortest.map_or(wait, |shortest| shortest.min(wait)));
                }
            }
        }
        Err(shortest.unwrap_or_default())
    }
}
