use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use log::{error, info, warn};
use netpace_lib::ws::{
    Channel, Connection, ConnectionBuilder, Message, SupervisorGroup, WeakConnection,
};

use crate::ExitCode;
use crate::options::{Config, WatchArgs};

/// Payload of every watched connection
struct Watched {
    key: String,
    gave_up: AtomicBool,
    /// Set right after the connection was built. Heartbeats go through it
    /// so they respect the send interval.
    connection: OnceLock<WeakConnection<Watched>>,
}

/// Supervise one connection per URL until all of them stopped or the user
/// interrupts
pub(crate) async fn watch(args: &WatchArgs, config: &Config) -> Result<ExitCode> {
    let mut supervisor_config = config.supervisor.clone();
    if !args.bind.is_empty() {
        supervisor_config.bind_ips.clone_from(&args.bind);
    }
    if let Some(heartbeat) = args.heartbeat {
        supervisor_config.heartbeat_interval = heartbeat;
    }

    let connections = args
        .urls
        .iter()
        .map(|uri| connection(uri, args))
        .collect::<Result<Vec<_>>>()?;

    let group = SupervisorGroup::new("watch", &supervisor_config);
    for connection in &connections {
        let supervisor = group.start_client(connection.clone());
        info!("Watching {} via {}", connection.key(), supervisor.name());
    }

    tokio::select! {
        () = group.sync() => info!("All connections stopped"),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("Cannot listen for Ctrl-C")?;
            info!("Interrupted, closing connections");
            for connection in &connections {
                connection.stop().await;
            }
        }
    }

    let gave_up = connections
        .iter()
        .any(|connection| connection.payload().gave_up.load(Ordering::SeqCst));
    Ok(if gave_up {
        ExitCode::RequestFailure
    } else {
        ExitCode::Success
    })
}

fn connection(uri: &str, args: &WatchArgs) -> Result<Connection<Watched>> {
    let payload = Watched {
        key: uri.to_string(),
        gave_up: AtomicBool::new(false),
        connection: OnceLock::new(),
    };
    let give_up = args.give_up;

    let mut builder = ConnectionBuilder::new(uri, uri, payload)
        .accept_invalid_certs(args.insecure)
        .on_frame(print_frame)
        .on_connect_error(move |e, watched: &Watched| {
            if give_up {
                error!("[{}] Giving up: {e}", watched.key);
                watched.gave_up.store(true, Ordering::SeqCst);
                return false;
            }
            warn!("[{}] {e}, retrying", watched.key);
            true
        });

    if let Some(max_inactive) = args.max_inactive {
        builder = builder.max_inactive_time(max_inactive);
    }
    if let Some(reconnect) = args.reconnect {
        builder = builder.reconnect_interval(reconnect);
    }
    if let Some(send_interval) = args.send_interval {
        builder = builder.send_interval(send_interval);
    }
    if let Some(ping) = args.ping.clone() {
        builder = builder.on_heartbeat(move |_, watched: &Watched| {
            match watched.connection.get().and_then(WeakConnection::upgrade) {
                Some(connection) => connection.send_text(ping.as_str()).map(|_| ()),
                None => Ok(()),
            }
        });
    }

    let connection = builder
        .build()
        .with_context(|| format!("Cannot watch `{uri}`"))?;
    let _ = connection.payload().connection.set(connection.downgrade());
    Ok(connection)
}

fn print_frame(_: &Channel, message: Message, watched: &Watched) {
    match message {
        Message::Text(text) => println!("[{}] {}", watched.key, text.as_str()),
        Message::Binary(data) => println!("[{}] <{} bytes>", watched.key, data.len()),
        _ => {}
    }
}
