//! A `--verbose`/`--quiet` flag pair for the command line
//!
//! By default, info messages and above are reported.
//! - `-q` only shows warnings, `-qq` only errors
//! - `-v` shows debug
//! - `-vv` shows trace

use log::Level;
use log::LevelFilter;

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    /// Pass many times for more log output
    ///
    /// By default, info messages and above are logged. Passing `-v` one time
    /// also prints debug messages, `-vv` enables trace logging.
    #[arg(
        long,
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet",
    )]
    verbose: u8,

    /// Pass many times for less log output
    #[arg(
        long,
        short = 'q',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "verbose",
    )]
    quiet: u8,
}

impl Verbosity {
    /// Get the log level.
    pub(crate) const fn log_level(&self) -> Level {
        level_enum(self.verbosity())
    }

    /// Get the log level filter.
    pub(crate) fn log_level_filter(&self) -> LevelFilter {
        self.log_level().to_level_filter()
    }

    #[allow(clippy::cast_possible_wrap)]
    const fn verbosity(&self) -> i8 {
        level_value(Level::Info) - (self.quiet as i8) + (self.verbose as i8)
    }
}

const fn level_value(level: Level) -> i8 {
    match level {
        Level::Error => 0,
        Level::Warn => 1,
        Level::Info => 2,
        Level::Debug => 3,
        Level::Trace => 4,
    }
}

const fn level_enum(verbosity: i8) -> Level {
    match verbosity {
        i8::MIN..=0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, clap::Parser)]
    struct Cli {
        #[clap(flatten)]
        verbose: Verbosity,
    }

    #[test]
    fn verify_app() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_log_level() {
        let verbosity = Verbosity::default();
        assert_eq!(verbosity.log_level(), Level::Info);
    }

    #[test]
    fn test_flags_shift_the_level() {
        use clap::Parser;

        let level = |args: &[&str]| {
            Cli::try_parse_from(std::iter::once("netpace").chain(args.iter().copied()))
                .unwrap()
                .verbose
                .log_level()
        };
        assert_eq!(level(&["-v"]), Level::Debug);
        assert_eq!(level(&["-vvvv"]), Level::Trace);
        assert_eq!(level(&["-q"]), Level::Warn);
        assert_eq!(level(&["-qqq"]), Level::Error);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        use clap::Parser;
        assert!(Cli::try_parse_from(["netpace", "-v", "-q"]).is_err());
    }
}
