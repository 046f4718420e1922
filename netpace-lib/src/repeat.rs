use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace};
use tokio::time::{Instant, sleep};

use crate::config::RepeatConfig;
use crate::{DeferredResult, Operation, Requester};

#[derive(Default)]
struct RepeatState {
    tasks: Option<Vec<Operation>>,
    /// Bumped on every stop; a loop exits once its generation is outdated
    generation: u64,
    running: bool,
}

/// Periodically resubmits a set of operations.
///
/// Each round submits the whole task list through the wrapped [`Requester`],
/// waits until every returned result completed, then sleeps for what is left
/// of the interval. A round taking longer than the interval is followed by
/// the next one immediately.
///
/// Changes to the task list become visible at the start of the next round.
pub struct RepeatScheduler {
    requester: Arc<dyn Requester>,
    interval: Duration,
    state: Arc<Mutex<RepeatState>>,
}

impl RepeatScheduler {
    /// Create a stopped scheduler. It starts with the first task list.
    #[must_use]
    pub fn new<R>(requester: R, interval: Duration) -> Self
    where
        R: Requester + 'static,
    {
        Self {
            requester: Arc::new(requester),
            interval,
            state: Arc::default(),
        }
    }

    /// Create a stopped scheduler with the period of `config`
    #[must_use]
    pub fn from_config<R>(requester: R, config: &RepeatConfig) -> Self
    where
        R: Requester + 'static,
    {
        Self::new(requester, config.interval)
    }

    /// Swap the task list and return the previous one.
    ///
    /// `None` stops the loop before its next round. A list starts the loop if
    /// none is running.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned, or if a loop has to be started
    /// outside of a tokio runtime.
    pub fn set_tasks(&self, tasks: Option<Vec<Operation>>) -> Option<Vec<Operation>> {
        let mut state = self.state.lock().unwrap();
        let stop = tasks.is_none();
        let previous = std::mem::replace(&mut state.tasks, tasks);

        if stop {
            state.generation += 1;
            state.running = false;
        } else if !state.running {
            self.start(&mut state);
        }
        previous
    }

    /// Stop repeating and return the current task list
    pub fn stop(&self) -> Option<Vec<Operation>> {
        self.set_tasks(None)
    }

    /// Append a task, starting with a single-entry list if there is none
    ///
    /// # Panics
    ///
    /// See [`RepeatScheduler::set_tasks`].
    pub fn add_task(&self, operation: Operation) {
        let mut state = self.state.lock().unwrap();
        match state.tasks.as_mut() {
            Some(tasks) => tasks.push(operation),
            None => {
                state.tasks = Some(vec![operation]);
                if !state.running {
                    self.start(&mut state);
                }
            }
        }
    }

    /// Remove a task. Returns `false` if it was not in the list.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned
    pub fn remove_task(&self, operation: &Operation) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(tasks) = state.tasks.as_mut() else {
            return false;
        };
        let before = tasks.len();
        tasks.retain(|task| task != operation);
        tasks.len() != before
    }

    /// A copy of the current task list
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned
    #[must_use]
    pub fn tasks(&self) -> Option<Vec<Operation>> {
        self.state.lock().unwrap().tasks.clone()
    }

    /// True while a loop is running
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn start(&self, state: &mut RepeatState) {
        state.running = true;
        debug!("Starting repeat loop, interval {:?}", self.interval);
        tokio::spawn(repeat(
            Arc::downgrade(&self.state),
            state.generation,
            self.requester.clone(),
            self.interval,
        ));
    }
}

impl Drop for RepeatScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RepeatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatScheduler")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// The round's task list, or `None` once the loop has been superseded
fn current_round(state: &Weak<Mutex<RepeatState>>, generation: u64) -> Option<Vec<Operation>> {
    let state = state.upgrade()?;
    let state = state.lock().unwrap();
    if state.generation != generation {
        return None;
    }
    state.tasks.clone()
}

async fn repeat(
    state: Weak<Mutex<RepeatState>>,
    generation: u64,
    requester: Arc<dyn Requester>,
    interval: Duration,
) {
    while let Some(tasks) = current_round(&state, generation) {
        let started = Instant::now();
        trace!("Repeat round with {} tasks", tasks.len());

        let results = requester.request_all(&tasks);
        DeferredResult::join_all(results).await;

        sleep(interval.saturating_sub(started.elapsed())).await;
    }
    debug!("Repeat loop {generation} stopped");
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use url::Url;

    use super::*;
    use crate::{Reply, TransportHandle};

    type RoundLog = Arc<Mutex<Vec<(u64, Instant)>>>;

    /// Completes every operation after `delay`
    struct SlowLane {
        delay: Duration,
        log: RoundLog,
    }

    impl Requester for SlowLane {
        fn request(&self, operation: Operation) -> Option<DeferredResult> {
            self.log
                .lock()
                .unwrap()
                .push((operation.id(), Instant::now()));
            let delay = self.delay;
            let url = operation.resolve().ok()?.url;
            Some(DeferredResult::bound(TransportHandle::spawn(async move {
                sleep(delay).await;
                Ok(Reply::new(StatusCode::OK, url, "ok"))
            })))
        }
    }

    fn scheduler(delay: Duration, interval: Duration) -> (RepeatScheduler, RoundLog) {
        let log = RoundLog::default();
        let lane = SlowLane {
            delay,
            log: log.clone(),
        };
        (RepeatScheduler::new(lane, interval), log)
    }

    fn operation() -> Operation {
        Operation::get(Url::parse("http://localhost/depth").unwrap())
    }

    fn round_starts(log: &RoundLog, start: Instant) -> Vec<u64> {
        log.lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(start).as_millis() as u64)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_remainder_of_interval() {
        let (scheduler, log) = scheduler(Duration::from_millis(300), Duration::from_secs(1));
        let start = Instant::now();
        scheduler.set_tasks(Some(vec![operation()]));

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(round_starts(&log, start), vec![0, 1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_round_is_followed_immediately() {
        let (scheduler, log) = scheduler(Duration::from_millis(1500), Duration::from_secs(1));
        let start = Instant::now();
        scheduler.set_tasks(Some(vec![operation()]));

        sleep(Duration::from_millis(3500)).await;
        assert_eq!(round_starts(&log, start), vec![0, 1500, 3000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_swap() {
        let (scheduler, log) = scheduler(Duration::ZERO, Duration::from_secs(1));
        let first = vec![operation()];

        assert!(scheduler.set_tasks(Some(first.clone())).is_none());
        assert!(scheduler.is_running());
        sleep(Duration::from_millis(1500)).await;

        assert_eq!(scheduler.set_tasks(None), Some(first));
        assert!(!scheduler.is_running());
        let rounds = log.lock().unwrap().len();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().unwrap().len(), rounds);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_runs_a_single_loop() {
        let (scheduler, log) = scheduler(Duration::ZERO, Duration::from_secs(1));
        let start = Instant::now();

        scheduler.set_tasks(Some(vec![operation()]));
        scheduler.set_tasks(None);
        scheduler.set_tasks(Some(vec![operation()]));

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(round_starts(&log, start), vec![0, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_and_remove_take_effect_next_round() {
        let (scheduler, log) = scheduler(Duration::from_millis(100), Duration::from_secs(1));
        let first = operation();
        let second = operation();

        scheduler.add_task(first.clone());
        assert!(scheduler.is_running());
        sleep(Duration::from_millis(50)).await;

        // Mid-round mutations are seen from the next round on
        scheduler.add_task(second.clone());
        assert!(scheduler.remove_task(&first));
        assert!(!scheduler.remove_task(&first));
        sleep(Duration::from_millis(2500)).await;

        let ids: Vec<_> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![first.id(), second.id(), second.id()]);
        assert_eq!(scheduler.tasks(), Some(vec![second]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_loop() {
        let (scheduler, log) = scheduler(Duration::ZERO, Duration::from_secs(1));
        scheduler.add_task(operation());
        sleep(Duration::from_millis(500)).await;
        drop(scheduler);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
