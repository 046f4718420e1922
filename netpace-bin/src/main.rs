//! `netpace` sends HTTP requests at a bounded rate and keeps WebSocket
//! connections alive.
//!
//! The netpace binary is a wrapper around netpace-lib, which provides
//! convenience functions for calling netpace from the command-line.
//!
//! Request two URLs, at most one request every two seconds:
//! ```sh
//! netpace poll --interval 2s https://example.com/a https://example.com/b
//! ```
//!
//! Spread requests over two local addresses and repeat them every minute:
//! ```sh
//! netpace poll --bind 10.0.0.1 --bind 10.0.0.2 --repeat 1m https://example.com/status
//! ```
//!
//! Watch a WebSocket stream, pinging it every 20 seconds:
//! ```sh
//! netpace watch --heartbeat 20s --ping ping wss://stream.example.com/ws
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::error;

mod commands;
mod logging;
mod options;
mod verbosity;

use crate::logging::init_logging;
use crate::options::{Command, Config, NETPACE_CONFIG_FILE, NetpaceOptions};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator.
    #[allow(unused)]
    UnexpectedFailure = 1,
    RequestFailure = 2,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap the main code in another function to ensure that.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Load the explicitly given configuration file, or `netpace.toml` from the
/// current directory if it exists
fn load_config(opts: &NetpaceOptions) -> Result<Config> {
    if let Some(config_file) = &opts.config_file {
        return Config::load_from_file(config_file).with_context(|| {
            format!("Cannot load configuration file `{}`", config_file.display())
        });
    }

    let default_config = PathBuf::from(NETPACE_CONFIG_FILE);
    if !default_config.is_file() {
        return Ok(Config::default());
    }
    match Config::load_from_file(&default_config) {
        Ok(config) => Ok(config),
        Err(e) => bail!(
            "Cannot load default configuration file `{}`: {e:?}",
            default_config.display()
        ),
    }
}

/// Set up runtime and call netpace entrypoint
fn run_main() -> Result<i32> {
    let opts = NetpaceOptions::parse();
    init_logging(&opts.verbose);

    let config = match load_config(&opts) {
        Ok(config) => config,
        Err(e) => {
            error!("Error while loading config: {e:?}");
            return Ok(ExitCode::ConfigFile as i32);
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(run(&opts, &config))?;
    Ok(exit_code as i32)
}

async fn run(opts: &NetpaceOptions, config: &Config) -> Result<ExitCode> {
    match &opts.command {
        Command::Poll(args) => commands::poll(args, config).await,
        Command::Watch(args) => commands::watch(args, config).await,
    }
}
