//! Command-line interface handling.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Parsed command-line options.
///
/// Everything here overrides the corresponding config-file setting.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the bind address
    pub bind_address: Option<String>,
    /// Optional override for the log level
    pub log_level: Option<String>,
    /// Force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses command line arguments using clap.
    pub fn parse() -> Self {
        let matches = Command::new("Thornmoor Server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Persistent multiplayer text-game server")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Path to the TOML configuration file")
                    .default_value("thornmoor.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDR")
                    .help("Bind address, overriding the config file"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .action(ArgAction::SetTrue)
                    .help("Emit JSON-formatted log lines"),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(matches.get_one::<String>("config").expect("has default")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
