//! The easyrsa command line front-end.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use crate::commons::error;
use crate::config::{Config, ConfigError};
use crate::constants::{
    EASYRSA_APP, EASYRSA_CLI_CONFIG_ARG, EASYRSA_CLI_CONFIG_DFLT,
    EASYRSA_CLI_KEY_DIR_ARG, EASYRSA_CLI_LOG_LEVEL_ARG, EASYRSA_VERSION,
};
use crate::crypto::{CertOption, CertRole};
use crate::pki::init_disk_pki;

//------------ SubCommand ----------------------------------------------------

/// The work to perform.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubCommand {
    BuildCa {
        cn: Option<String>,
    },
    BuildServerKey {
        cn: String,
        dns_names: Vec<String>,
        ip_addresses: Vec<IpAddr>,
    },
    BuildKey {
        cn: String,
    },
    RevokeFull {
        cn: String,
    },
}

//------------ Options -------------------------------------------------------

/// Everything parsed off the command line.
#[derive(Clone, Debug)]
pub struct Options {
    pub config_file: PathBuf,
    pub config_required: bool,
    pub key_dir: Option<PathBuf>,
    pub log_level: Option<LevelFilter>,
    pub command: SubCommand,
}

impl Options {
    /// The clap command tree.
    pub fn make_clap_app() -> Command {
        Command::new(EASYRSA_APP)
            .version(EASYRSA_VERSION)
            .about("Issue and revoke certificates in an easy-rsa style PKI")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .arg(
                Arg::new(EASYRSA_CLI_KEY_DIR_ARG)
                    .short('k')
                    .long(EASYRSA_CLI_KEY_DIR_ARG)
                    .value_name("DIR")
                    .help("The PKI root directory")
                    .global(true),
            )
            .arg(
                Arg::new(EASYRSA_CLI_CONFIG_ARG)
                    .short('c')
                    .long(EASYRSA_CLI_CONFIG_ARG)
                    .value_name("FILE")
                    .help("Read settings from this TOML file")
                    .global(true),
            )
            .arg(
                Arg::new(EASYRSA_CLI_LOG_LEVEL_ARG)
                    .long(EASYRSA_CLI_LOG_LEVEL_ARG)
                    .value_name("LEVEL")
                    .help("Log level: off, error, warn, info, debug, trace")
                    .global(true),
            )
            .subcommand(
                Command::new("build-ca").about("build ca cert/key").arg(
                    Arg::new("cn")
                        .value_name("CN")
                        .help("Override the subject common name"),
                ),
            )
            .subcommand(
                Command::new("build-server-key")
                    .about("build server cert/key")
                    .arg(
                        Arg::new("cn")
                            .value_name("CN")
                            .required(true)
                            .help("The server's common name"),
                    )
                    .arg(
                        Arg::new("dns")
                            .long("dns")
                            .value_name("NAME")
                            .action(ArgAction::Append)
                            .help("Add a DNS name to the certificate"),
                    )
                    .arg(
                        Arg::new("ip")
                            .long("ip")
                            .value_name("ADDR")
                            .action(ArgAction::Append)
                            .help("Add an IP address to the certificate"),
                    ),
            )
            .subcommand(
                Command::new("build-key").about("build client cert/key").arg(
                    Arg::new("cn")
                        .value_name("CN")
                        .required(true)
                        .help("The client's common name"),
                ),
            )
            .subcommand(
                Command::new("revoke-full")
                    .about("revoke all certs with a common name")
                    .arg(
                        Arg::new("cn")
                            .value_name("CN")
                            .required(true)
                            .help("The common name to revoke"),
                    ),
            )
    }

    pub fn from_args() -> Result<Self, Error> {
        let matches = Self::make_clap_app().get_matches();
        Self::from_matches(&matches)
    }

    pub fn from_matches(matches: &ArgMatches) -> Result<Self, Error> {
        let config_required = matches
            .value_source(EASYRSA_CLI_CONFIG_ARG)
            .map(|source| source == ValueSource::CommandLine)
            .unwrap_or(false);
        let config_file = matches
            .get_one::<String>(EASYRSA_CLI_CONFIG_ARG)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(EASYRSA_CLI_CONFIG_DFLT));

        let key_dir = matches
            .get_one::<String>(EASYRSA_CLI_KEY_DIR_ARG)
            .map(PathBuf::from);

        let log_level = match matches
            .get_one::<String>(EASYRSA_CLI_LOG_LEVEL_ARG)
        {
            Some(level) => Some(level.parse().map_err(|_| {
                Error::other(format!("unknown log level '{}'", level))
            })?),
            None => None,
        };

        let command = match matches.subcommand() {
            Some(("build-ca", matches)) => SubCommand::BuildCa {
                cn: matches.get_one::<String>("cn").cloned(),
            },
            Some(("build-server-key", matches)) => {
                let mut ip_addresses = Vec::new();
                if let Some(addrs) = matches.get_many::<String>("ip") {
                    for addr in addrs {
                        ip_addresses.push(addr.parse().map_err(|_| {
                            Error::other(format!(
                                "'{}' is not an IP address",
                                addr
                            ))
                        })?);
                    }
                }
                SubCommand::BuildServerKey {
                    cn: matches.get_one::<String>("cn").unwrap().clone(),
                    dns_names: matches
                        .get_many::<String>("dns")
                        .map(|names| names.cloned().collect())
                        .unwrap_or_default(),
                    ip_addresses,
                }
            }
            Some(("build-key", matches)) => SubCommand::BuildKey {
                cn: matches.get_one::<String>("cn").unwrap().clone(),
            },
            Some(("revoke-full", matches)) => SubCommand::RevokeFull {
                cn: matches.get_one::<String>("cn").unwrap().clone(),
            },
            _ => unreachable!("clap enforces a subcommand"),
        };

        Ok(Options {
            config_file,
            config_required,
            key_dir,
            log_level,
            command,
        })
    }
}

//------------ Running -------------------------------------------------------

/// Parses the command line and performs the requested operation.
pub fn run() -> Result<(), Error> {
    let options = Options::from_args()?;

    let mut config =
        Config::read(&options.config_file, options.config_required)?;
    if let Some(key_dir) = &options.key_dir {
        config.key_dir = key_dir.clone();
    }
    if let Some(level) = options.log_level {
        config.log_level = level;
    }
    config.init_logging()?;

    let pki = init_disk_pki(&config.key_dir, config.subject.clone())?;

    match options.command {
        SubCommand::BuildCa { cn } => {
            let opts: Vec<CertOption> =
                cn.map(CertOption::Cn).into_iter().collect();
            let pair = pki.new_ca(&opts)?;
            info!("built ca pair with serial {}", pair.serial());
        }
        SubCommand::BuildServerKey {
            cn,
            dns_names,
            ip_addresses,
        } => {
            let mut opts = vec![CertOption::Server];
            if !dns_names.is_empty() {
                opts.push(CertOption::DnsNames(dns_names));
            }
            if !ip_addresses.is_empty() {
                opts.push(CertOption::IpAddresses(ip_addresses));
            }
            let pair = pki.new_cert_with(&cn, &opts)?;
            info!(
                "built server pair for '{}' with serial {}",
                cn,
                pair.serial()
            );
        }
        SubCommand::BuildKey { cn } => {
            let pair = pki.new_cert(&cn, CertRole::Client)?;
            info!(
                "built client pair for '{}' with serial {}",
                cn,
                pair.serial()
            );
        }
        SubCommand::RevokeFull { cn } => {
            pki.revoke_all_by_cn(&cn)?;
            info!("revoked all pairs for '{}'", cn);
        }
    }

    Ok(())
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Pki(error::Error),
    Config(ConfigError),
    Other(String),
}

impl Error {
    fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Pki(err) => err.fmt(f),
            Error::Config(err) => err.fmt(f),
            Error::Other(msg) => msg.fmt(f),
        }
    }
}

impl From<error::Error> for Error {
    fn from(err: error::Error) -> Self {
        Error::Pki(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, Error> {
        let matches = Options::make_clap_app()
            .try_get_matches_from(args)
            .expect("argument parsing failed");
        Options::from_matches(&matches)
    }

    #[test]
    fn parses_build_ca() {
        let options = parse(&["easyrsa", "build-ca"]).unwrap();
        assert_eq!(options.command, SubCommand::BuildCa { cn: None });
        assert!(options.key_dir.is_none());
        assert!(!options.config_required);
    }

    #[test]
    fn parses_server_key_with_sans() {
        let options = parse(&[
            "easyrsa",
            "-k",
            "/tmp/pki",
            "build-server-key",
            "www",
            "--dns",
            "www.example.org",
            "--dns",
            "example.org",
            "--ip",
            "192.0.2.10",
        ])
        .unwrap();

        assert_eq!(options.key_dir, Some(PathBuf::from("/tmp/pki")));
        match options.command {
            SubCommand::BuildServerKey {
                cn,
                dns_names,
                ip_addresses,
            } => {
                assert_eq!(cn, "www");
                assert_eq!(dns_names, vec!["www.example.org", "example.org"]);
                assert_eq!(
                    ip_addresses,
                    vec!["192.0.2.10".parse::<IpAddr>().unwrap()]
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_ip_addresses() {
        let err = parse(&[
            "easyrsa",
            "build-server-key",
            "www",
            "--ip",
            "not-an-ip",
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn explicit_config_is_required() {
        let options = parse(&[
            "easyrsa",
            "--config",
            "/etc/easyrsa.toml",
            "build-key",
            "alice",
        ])
        .unwrap();
        assert!(options.config_required);
        assert_eq!(
            options.config_file,
            PathBuf::from("/etc/easyrsa.toml")
        );
    }

    #[test]
    fn missing_subcommand_is_rejected() {
        assert!(Options::make_clap_app()
            .try_get_matches_from(["easyrsa"])
            .is_err());
    }
}
