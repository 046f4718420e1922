use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use netpace_lib::config::DispatcherConfig;
use netpace_lib::{
    ErrorKind, Lane, Operation, RepeatScheduler, Reply, Requester, ThrottledDispatcher,
};
use url::Url;

use crate::ExitCode;
use crate::options::{Config, PollArgs};

/// Request every URL through a throttled dispatcher, once or repeatedly
pub(crate) async fn poll(args: &PollArgs, config: &Config) -> Result<ExitCode> {
    let lanes = create_lanes(args, config)?;
    let dispatcher_config = DispatcherConfig::from_options(
        args.interval.or(config.interval),
        args.capacity.or(config.capacity),
    );
    info!(
        "Polling {} URLs over {} lanes, one request per lane every {:?}",
        args.urls.len(),
        lanes.len(),
        dispatcher_config.interval
    );
    let dispatcher = ThrottledDispatcher::from_config(lanes, &dispatcher_config)
        .context("Cannot create dispatcher")?;

    match args.repeat.or(config.repeat) {
        Some(interval) => repeat(dispatcher, &args.urls, interval).await,
        None => Ok(once(&dispatcher, &args.urls).await),
    }
}

/// One lane per bind address, or the configured number of unbound lanes
fn create_lanes(args: &PollArgs, config: &Config) -> Result<Vec<Lane>> {
    if !args.bind.is_empty() {
        return args
            .bind
            .iter()
            .map(|ip| {
                config
                    .lane
                    .clone()
                    .with_local_ip(Some(*ip))
                    .lane()
                    .with_context(|| format!("Cannot create lane bound to {ip}"))
            })
            .collect();
    }

    let count = args.lanes.or(config.lanes).unwrap_or(1);
    (0..count)
        .map(|_| config.lane.clone().lane().context("Cannot create lane"))
        .collect()
}

async fn once(dispatcher: &ThrottledDispatcher, urls: &[Url]) -> ExitCode {
    let operations: Vec<_> = urls.iter().cloned().map(Operation::get).collect();
    let results = dispatcher.request_all(&operations);

    let mut exit_code = ExitCode::Success;
    for (url, result) in urls.iter().zip(results) {
        let outcome = match result {
            Some(result) => result.wait().await,
            None => Err(ErrorKind::Overflow {
                capacity: dispatcher.capacity(),
            }),
        };
        if !report(url, &outcome) {
            exit_code = ExitCode::RequestFailure;
        }
    }
    exit_code
}

async fn repeat(
    dispatcher: ThrottledDispatcher,
    urls: &[Url],
    interval: Duration,
) -> Result<ExitCode> {
    let operations = urls
        .iter()
        .map(|url| {
            let target = url.clone();
            Operation::get(url.clone()).with_callback(move |outcome| {
                report(&target, &outcome);
            })
        })
        .collect();

    let scheduler = RepeatScheduler::new(dispatcher, interval);
    scheduler.set_tasks(Some(operations));

    tokio::signal::ctrl_c()
        .await
        .context("Cannot listen for Ctrl-C")?;
    info!("Interrupted, stopping");
    scheduler.stop();
    Ok(ExitCode::Success)
}

/// Print one result line; returns `true` for a successful reply
fn report(url: &Url, outcome: &netpace_lib::Result<Reply>) -> bool {
    match outcome {
        Ok(reply) => {
            println!("{} {url} ({} bytes)", reply.status, reply.body.len());
            reply.status.is_success()
        }
        Err(e) => {
            println!("ERROR {url}: {e}");
            false
        }
    }
}
