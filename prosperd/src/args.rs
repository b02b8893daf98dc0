use clap::{Arg, ArgAction, Command, arg};
use prosper_polling::{DATA_SOURCES, PollingConfig};
use prosper_stratum::ServerConfig;
use serde::Deserialize;
use std::{ffi::OsString, fs};
use toml::from_str;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Args {
    // NOTE: property names match config file fields
    pub logdir: Option<String>,
    #[serde(rename = "loglevel")]
    pub log_level: String,
    /// Price source polled for peg prices. Unset disables polling.
    pub peg_source: Option<String>,
    pub poll_interval_secs: u64,
    pub server: ServerConfig,
    pub polling: PollingConfig,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            logdir: None,
            log_level: "info".into(),
            peg_source: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            server: ServerConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

pub fn cli() -> Command {
    let defaults: Args = Default::default();

    Command::new("prosperd")
        .about(format!("{} v{}", env!("CARGO_PKG_DESCRIPTION"), env!("CARGO_PKG_VERSION")))
        .version(env!("CARGO_PKG_VERSION"))
        .arg(arg!(-C --configfile <CONFIG_FILE> "Path of a TOML config file."))
        .arg(arg!(--logdir <LOG_DIR> "Directory to log output."))
        .arg(
            Arg::new("log_level")
                .short('d')
                .long("loglevel")
                .env("PROSPERD_LOG_LEVEL")
                .value_name("LEVEL")
                .default_value("info")
                .require_equals(true)
                .help("Logging level for all subsystems {off, error, warn, info, debug, trace}\n-- You may also specify <subsystem>=<level>,<subsystem2>=<level>,... to set the log level for individual subsystems.".to_string()),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .env("PROSPERD_LISTEN")
                .value_name("IP:PORT")
                .require_equals(true)
                .help(format!("Interface and port the stratum server listens on (default: {}).", defaults.server.listen_address)),
        )
        .arg(Arg::new("verbose").short('v').long("verbose").action(ArgAction::SetTrue).help("Log every line read from miners."))
        .arg(
            Arg::new("peg_source")
                .long("pegsource")
                .value_name("SOURCE")
                .require_equals(true)
                .value_parser(DATA_SOURCES.to_vec())
                .ignore_case(true)
                .help("Poll peg prices from this source."),
        )
        .arg(
            Arg::new("poll_interval")
                .long("poll-interval-sec")
                .value_name("SECONDS")
                .require_equals(true)
                .value_parser(clap::value_parser!(u64).range(1..))
                .help(format!("Seconds between two price polls (default: {}).", defaults.poll_interval_secs)),
        )
}

pub fn parse_args() -> Args {
    match Args::parse(std::env::args_os()) {
        Ok(args) => args,
        Err(err) => {
            println!("{err}");
            std::process::exit(1);
        }
    }
}

impl Args {
    pub fn parse<I, T>(itr: I) -> Result<Args, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let m: clap::ArgMatches = cli().try_get_matches_from(itr)?;
        let mut defaults: Args = Default::default();

        if let Some(config_file) = m.get_one::<String>("configfile") {
            let config_str = fs::read_to_string(config_file)?;
            defaults = Self::from_toml(&config_str)?;
        }

        let mut server = defaults.server;
        if let Some(listen) = m.get_one::<String>("listen") {
            server.listen_address = listen.clone();
        }
        server.verbose |= m.get_flag("verbose");

        Ok(Args {
            logdir: m.get_one::<String>("logdir").cloned().or(defaults.logdir),
            log_level: arg_match_unwrap_or::<String>(&m, "log_level", defaults.log_level),
            peg_source: m.get_one::<String>("peg_source").cloned().or(defaults.peg_source),
            poll_interval_secs: arg_match_unwrap_or::<u64>(&m, "poll_interval", defaults.poll_interval_secs),
            server,
            polling: defaults.polling,
        })
    }

    pub fn from_toml(config_str: &str) -> Result<Args, clap::Error> {
        from_str(config_str).map_err(|toml_error| {
            clap::Error::raw(clap::error::ErrorKind::ValueValidation, format!("failed parsing config file, reason: {}", toml_error.message()))
        })
    }
}

use clap::parser::ValueSource::DefaultValue;
fn arg_match_unwrap_or<T: Clone + Send + Sync + 'static>(m: &clap::ArgMatches, arg_id: &str, default: T) -> T {
    m.get_one::<T>(arg_id).cloned().filter(|_| m.value_source(arg_id) != Some(DefaultValue)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse(["prosperd"]).unwrap();
        assert_eq!(args.log_level, "info");
        assert_eq!(args.server.listen_address, "0.0.0.0:1234");
        assert!(!args.server.verbose);
        assert_eq!(args.peg_source, None);
        assert_eq!(args.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_command_line() {
        let args = Args::parse(["prosperd", "--listen=127.0.0.1:3333", "-v", "--loglevel=debug", "--pegsource=CoinCap", "--poll-interval-sec=5"])
            .unwrap();
        assert_eq!(args.server.listen_address, "127.0.0.1:3333");
        assert!(args.server.verbose);
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.peg_source.as_deref(), Some("coincap"));
        assert_eq!(args.poll_interval_secs, 5);
    }

    #[test]
    fn test_rejects_unknown_source() {
        assert!(Args::parse(["prosperd", "--pegsource=kraken"]).is_err());
        assert!(Args::parse(["prosperd", "--poll-interval-sec=0"]).is_err());
    }

    #[test]
    fn test_config_file() {
        let args = Args::from_toml(
            r#"
            loglevel = "warn"
            peg-source = "1forge"

            [server]
            listen-address = "127.0.0.1:4444"
            read-timeout-secs = 120
            max-messages-per-second = 5

            [polling]
            oneforge-key = "secret"

            [polling.backoff]
            max-attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(args.log_level, "warn");
        assert_eq!(args.peg_source.as_deref(), Some("1forge"));
        assert_eq!(args.server.listen_address, "127.0.0.1:4444");
        assert_eq!(args.server.read_timeout_secs, Some(120));
        assert_eq!(args.server.max_messages_per_second, Some(5));
        assert_eq!(args.polling.oneforge_key.as_deref(), Some("secret"));
        assert_eq!(args.polling.backoff.max_attempts, 2);

        assert!(Args::from_toml("listen = 3").is_err());
    }
}
