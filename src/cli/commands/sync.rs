use crate::validation::SyncLevels;
use clap::{Arg, ArgMatches, Command};

pub const ARG_SYNC_DEFAULT_LEVEL: &str = "sync-default-level";
pub const ARG_SYNC_FAST_LEVEL: &str = "sync-fast-level";
pub const ARG_SYNC_SECURE_LEVEL: &str = "sync-secure-level";
pub const ARG_SYNC_DEFAULT_TIMEOUT: &str = "sync-default-timeout";

#[derive(Debug, Clone)]
pub struct Options {
    pub levels: SyncLevels,
}

impl Options {
    /// Parse sync level arguments from matches.
    ///
    /// # Errors
    /// Never fails today, kept fallible like the other option groups.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let defaults = SyncLevels::default();
        let level = |id: &str, fallback: i32| matches.get_one::<i32>(id).copied().unwrap_or(fallback);

        Ok(Self {
            levels: SyncLevels {
                default: level(ARG_SYNC_DEFAULT_LEVEL, defaults.default),
                fast: level(ARG_SYNC_FAST_LEVEL, defaults.fast),
                secure: level(ARG_SYNC_SECURE_LEVEL, defaults.secure),
                default_timeout: matches
                    .get_one::<u64>(ARG_SYNC_DEFAULT_TIMEOUT)
                    .copied()
                    .unwrap_or(defaults.default_timeout),
            },
        })
    }
}

fn level_arg(id: &'static str, env: &'static str, default: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .default_value(default)
        .value_parser(clap::value_parser!(i32).range(0..=100))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(level_arg(
            ARG_SYNC_DEFAULT_LEVEL,
            "YKVAL_SYNC_DEFAULT_LEVEL",
            "60",
            "Sync level used when the request has no sl parameter",
        ))
        .arg(level_arg(
            ARG_SYNC_FAST_LEVEL,
            "YKVAL_SYNC_FAST_LEVEL",
            "1",
            "Sync level for sl=fast",
        ))
        .arg(level_arg(
            ARG_SYNC_SECURE_LEVEL,
            "YKVAL_SYNC_SECURE_LEVEL",
            "40",
            "Sync level for sl=secure",
        ))
        .arg(
            Arg::new(ARG_SYNC_DEFAULT_TIMEOUT)
                .long(ARG_SYNC_DEFAULT_TIMEOUT)
                .help("Seconds to wait for sync peers")
                .env("YKVAL_SYNC_DEFAULT_TIMEOUT")
                .default_value("1")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const VARS: [(&str, Option<&str>); 4] = [
        ("YKVAL_SYNC_DEFAULT_LEVEL", None),
        ("YKVAL_SYNC_FAST_LEVEL", None),
        ("YKVAL_SYNC_SECURE_LEVEL", None),
        ("YKVAL_SYNC_DEFAULT_TIMEOUT", None),
    ];

    #[test]
    fn defaults() {
        temp_env::with_vars(VARS, || {
            let matches = with_args(Command::new("test")).get_matches_from(["test"]);
            let options = Options::parse(&matches).unwrap();
            assert_eq!(options.levels, SyncLevels::default());
        });
    }

    #[test]
    fn flags_override_defaults() {
        temp_env::with_vars(VARS, || {
            let matches = with_args(Command::new("test")).get_matches_from([
                "test",
                "--sync-default-level",
                "50",
                "--sync-fast-level",
                "5",
                "--sync-secure-level",
                "90",
                "--sync-default-timeout",
                "4",
            ]);
            let levels = Options::parse(&matches).unwrap().levels;
            assert_eq!(levels.default, 50);
            assert_eq!(levels.fast, 5);
            assert_eq!(levels.secure, 90);
            assert_eq!(levels.default_timeout, 4);
        });
    }

    #[test]
    fn level_out_of_range() {
        temp_env::with_vars(VARS, || {
            let result = with_args(Command::new("test"))
                .try_get_matches_from(["test", "--sync-default-level", "101"]);
            assert!(result.is_err());
        });
    }
}
