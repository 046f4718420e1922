use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

use crate::verbosity::Verbosity;

/// Initialize the logging system with the given verbosity level.
pub(crate) fn init_logging(verbose: &Verbosity) {
    // Everything outside of netpace only logs warnings, unless RUST_LOG says
    // otherwise
    let env = Env::default().filter_or("RUST_LOG", "warn");

    let mut builder = Builder::from_env(env);

    if std::env::var("RUST_LOG").is_err() {
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("netpace", verbose.log_level_filter())
            .filter_module("netpace_lib", verbose.log_level_filter());
    }

    builder.format(|buf, record| {
        let level = record.level();
        let style = buf.default_level_style(level);
        writeln!(
            buf,
            "{} {style}[{level}]{style:#} {}",
            buf.timestamp_millis(),
            record.args()
        )
    });

    builder.init();
}
