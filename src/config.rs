//! Configuration for the easyrsa binary.
//!
//! Settings come from an optional TOML file; every field has a default
//! so an absent file simply means "all defaults". Command line flags
//! override file values.

use std::path::{Path, PathBuf};
use std::{fmt, io};

use log::LevelFilter;
use serde::{Deserialize, Deserializer};

use crate::constants::EASYRSA_CLI_KEY_DIR_DFLT;
use crate::crypto::SubjectTemplate;

//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The PKI root directory.
    #[serde(default = "Config::default_key_dir")]
    pub key_dir: PathBuf,

    /// The log level for the stderr logger.
    #[serde(
        default = "Config::default_log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    /// The distinguished-name template for issued certificates.
    #[serde(default)]
    pub subject: SubjectTemplate,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            key_dir: Self::default_key_dir(),
            log_level: Self::default_log_level(),
            subject: SubjectTemplate::default(),
        }
    }
}

impl Config {
    fn default_key_dir() -> PathBuf {
        PathBuf::from(EASYRSA_CLI_KEY_DIR_DFLT)
    }

    fn default_log_level() -> LevelFilter {
        LevelFilter::Warn
    }

    /// Reads the configuration from a TOML file.
    ///
    /// With `required` unset a missing file yields the defaults, so the
    /// conventional `./easyrsa.toml` location never has to exist.
    pub fn read(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound && !required => {
                return Ok(Config::default())
            }
            Err(err) => {
                return Err(ConfigError::Io(format!(
                    "can't read config file '{}': {}",
                    path.display(),
                    err
                )))
            }
        };
        toml::from_str(&text).map_err(|err| {
            ConfigError::Parse(format!(
                "invalid config file '{}': {}",
                path.display(),
                err
            ))
        })
    }

    /// Sets up the stderr logger.
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    message
                ))
            })
            .level(self.log_level)
            .chain(std::io::stderr())
            .apply()
            .map_err(|err| {
                ConfigError::Other(format!("cannot set up logging: {}", err))
            })
    }
}

fn de_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let string = String::deserialize(deserializer)?;
    string
        .parse()
        .map_err(|_| D::Error::custom(format!("unknown log level '{}'", string)))
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(msg)
            | ConfigError::Parse(msg)
            | ConfigError::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test;

    #[test]
    fn missing_optional_file_yields_defaults() {
        let config =
            Config::read(Path::new("/nonexistent/easyrsa.toml"), false)
                .unwrap();
        assert_eq!(config.key_dir, PathBuf::from("keys"));
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(config.subject, SubjectTemplate::default());
    }

    #[test]
    fn missing_required_file_is_an_error() {
        assert!(
            Config::read(Path::new("/nonexistent/easyrsa.toml"), true)
                .is_err()
        );
    }

    #[test]
    fn reads_subject_template_and_overrides() {
        test::test_under_tmp(|dir| {
            let path = dir.join("easyrsa.toml");
            std::fs::write(
                &path,
                r#"
                key_dir = "/var/lib/easyrsa"
                log_level = "debug"

                [subject]
                country = "NL"
                organization = "Example Org"
                "#,
            )
            .unwrap();

            let config = Config::read(&path, true).unwrap();
            assert_eq!(config.key_dir, PathBuf::from("/var/lib/easyrsa"));
            assert_eq!(config.log_level, LevelFilter::Debug);
            assert_eq!(config.subject.country.as_deref(), Some("NL"));
            assert_eq!(
                config.subject.organization.as_deref(),
                Some("Example Org")
            );
        })
    }

    #[test]
    fn rejects_unknown_fields() {
        test::test_under_tmp(|dir| {
            let path = dir.join("easyrsa.toml");
            std::fs::write(&path, "keydir = \"oops\"\n").unwrap();
            assert!(matches!(
                Config::read(&path, true),
                Err(ConfigError::Parse(_))
            ));
        })
    }
}
