use crate::ksm::{DecryptFailurePolicy, KsmConfig};
use anyhow::{bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;
use url::Url;

pub const ARG_KSM_URL: &str = "ksm-url";
pub const ARG_KSM_BUILTIN: &str = "ksm-builtin";
pub const ARG_KSM_TIMEOUT: &str = "ksm-timeout";
pub const ARG_KSM_BACKEND_ERRORS: &str = "ksm-backend-errors";

#[derive(Debug, Clone)]
pub struct Options {
    pub urls: Vec<String>,
    pub builtin: bool,
    pub timeout: u64,
    pub backend_errors: bool,
}

impl Options {
    /// Parse decryption arguments from matches.
    ///
    /// # Errors
    /// Returns an error if no decryption source is configured or a URL is invalid.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let urls: Vec<String> = matches
            .get_many::<String>(ARG_KSM_URL)
            .map(|values| {
                values
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        for url in &urls {
            Url::parse(url).with_context(|| format!("invalid --{ARG_KSM_URL}: {url}"))?;
        }

        let builtin = matches.get_flag(ARG_KSM_BUILTIN);
        if urls.is_empty() && !builtin {
            bail!("missing required argument: --{ARG_KSM_URL} or --{ARG_KSM_BUILTIN}");
        }

        Ok(Self {
            urls,
            builtin,
            timeout: matches.get_one::<u64>(ARG_KSM_TIMEOUT).copied().unwrap_or(10),
            backend_errors: matches.get_flag(ARG_KSM_BACKEND_ERRORS),
        })
    }

    #[must_use]
    pub fn config(&self) -> KsmConfig {
        KsmConfig {
            urls: self.urls.clone(),
            builtin: self.builtin,
            timeout: Duration::from_secs(self.timeout),
        }
    }

    #[must_use]
    pub fn failure_policy(&self) -> DecryptFailurePolicy {
        if self.backend_errors {
            DecryptFailurePolicy::Distinguish
        } else {
            DecryptFailurePolicy::BadOtp
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_KSM_URL)
                .long(ARG_KSM_URL)
                .help("KSM decrypt endpoint, repeat or separate with commas")
                .long_help(
                    "KSM decrypt endpoint. The OTP is appended as `?otp=<otp>` and every endpoint is\nqueried concurrently, the first successful answer wins.",
                )
                .env("YKVAL_KSM_URLS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_KSM_BUILTIN)
                .long(ARG_KSM_BUILTIN)
                .help("Decrypt OTPs locally with the AES keys stored in the database")
                .env("YKVAL_KSM_BUILTIN")
                .action(ArgAction::SetTrue)
                .conflicts_with(ARG_KSM_URL),
        )
        .arg(
            Arg::new(ARG_KSM_TIMEOUT)
                .long(ARG_KSM_TIMEOUT)
                .help("Seconds to wait for the KSM endpoints")
                .env("YKVAL_KSM_TIMEOUT")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_KSM_BACKEND_ERRORS)
                .long(ARG_KSM_BACKEND_ERRORS)
                .help("Answer BACKEND_ERROR instead of BAD_OTP when the KSM cannot be reached")
                .env("YKVAL_KSM_BACKEND_ERRORS")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        temp_env::with_vars(
            [
                ("YKVAL_KSM_URLS", None::<&str>),
                ("YKVAL_KSM_BUILTIN", None),
                ("YKVAL_KSM_TIMEOUT", None),
                ("YKVAL_KSM_BACKEND_ERRORS", None),
            ],
            || {
                let mut argv = vec!["test"];
                argv.extend_from_slice(args);
                with_args(Command::new("test")).get_matches_from(argv)
            },
        )
    }

    #[test]
    fn urls_repeat_and_split() {
        let options = Options::parse(&matches(&[
            "--ksm-url",
            "http://ksm1/wsapi/decrypt,http://ksm2/wsapi/decrypt",
            "--ksm-url",
            "http://ksm3/wsapi/decrypt",
        ]))
        .unwrap();

        assert_eq!(
            options.urls,
            vec![
                "http://ksm1/wsapi/decrypt",
                "http://ksm2/wsapi/decrypt",
                "http://ksm3/wsapi/decrypt"
            ]
        );
        assert!(!options.builtin);
        assert_eq!(options.config().timeout, Duration::from_secs(10));
        assert_eq!(options.failure_policy(), DecryptFailurePolicy::BadOtp);
    }

    #[test]
    fn builtin_without_urls() {
        let options = Options::parse(&matches(&[
            "--ksm-builtin",
            "--ksm-timeout",
            "3",
            "--ksm-backend-errors",
        ]))
        .unwrap();

        assert!(options.builtin);
        assert!(options.urls.is_empty());
        assert_eq!(options.timeout, 3);
        assert_eq!(options.failure_policy(), DecryptFailurePolicy::Distinguish);
    }

    #[test]
    fn no_source_is_an_error() {
        let err = Options::parse(&matches(&[])).unwrap_err();
        assert!(err.to_string().contains("--ksm-url"));
    }

    #[test]
    fn invalid_url_is_an_error() {
        assert!(Options::parse(&matches(&["--ksm-url", "not a url"])).is_err());
    }

    #[test]
    fn urls_from_env() {
        temp_env::with_vars(
            [("YKVAL_KSM_URLS", Some("http://a/decrypt,http://b/decrypt"))],
            || {
                let matches = with_args(Command::new("test")).get_matches_from(["test"]);
                let options = Options::parse(&matches).unwrap();
                assert_eq!(options.urls, vec!["http://a/decrypt", "http://b/decrypt"]);
            },
        );
    }
}
