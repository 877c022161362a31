use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt};

use clap::Parser;
use log::{LevelFilter, error, info};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::constants::*;
use crate::signer::algorithm::{DigestAlgorithm, SignAlgorithm};

//------------ Options -------------------------------------------------------

/// The command line options for the token signer daemon.
#[derive(clap::Parser)]
#[command(version, about = "The signing token daemon.")]
pub struct Options {
    /// Path to the config file.
    #[arg(
        short, long,
        env = TOKENSIGNER_ENV_CONFIG,
        default_value = TOKENSIGNER_DEFAULT_CONFIG_FILE,
    )]
    pub config: PathBuf,
}

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    fn log_level() -> LevelFilter {
        match env::var(TOKENSIGNER_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        TOKENSIGNER_ENV_LOG_LEVEL
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::File
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./tokensigner.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn key_length() -> u32 {
        2048
    }

    fn csr_signature_digest() -> DigestAlgorithm {
        DigestAlgorithm::Sha256
    }

    fn module_update_interval_seconds() -> u64 {
        60
    }

    fn signature_timeout_seconds() -> u64 {
        10
    }

    fn sign_mechanism() -> String {
        DEFAULT_SIGN_MECHANISM.to_string()
    }

    fn batch_signing_enabled() -> bool {
        true
    }

    fn token_id_format() -> String {
        DEFAULT_TOKEN_ID_FORMAT.to_string()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the token signer.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "deserialize_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default)]
    pub enforce_token_pin_policy: bool,

    #[serde(default = "ConfigDefaults::key_length")]
    pub key_length: u32,

    #[serde(default = "ConfigDefaults::csr_signature_digest")]
    pub csr_signature_digest: DigestAlgorithm,

    #[serde(default = "ConfigDefaults::module_update_interval_seconds")]
    pub module_update_interval_seconds: u64,

    #[serde(default = "ConfigDefaults::signature_timeout_seconds")]
    pub signature_timeout_seconds: u64,

    #[serde(default)]
    pub hsm_modules: Vec<ModuleConf>,
}

/// # Accessors
impl Config {
    pub fn key_conf_file(&self) -> PathBuf {
        self.data_dir.join(KEY_CONF_FILE)
    }

    pub fn soft_token_dir(&self) -> PathBuf {
        self.data_dir.join(SOFT_TOKEN_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join(TMP_FILE_DIR)
    }

    pub fn module_update_interval(&self) -> Duration {
        Duration::from_secs(self.module_update_interval_seconds)
    }

    pub fn signature_timeout(&self) -> Duration {
        Duration::from_secs(self.signature_timeout_seconds)
    }
}

/// # Create
impl Config {
    /// Returns a configuration with all defaults for the given data dir,
    /// logging to stderr.
    pub fn test(data_dir: &Path) -> Self {
        Config {
            data_dir: data_dir.to_path_buf(),
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            enforce_token_pin_policy: true,
            key_length: ConfigDefaults::key_length(),
            csr_signature_digest: ConfigDefaults::csr_signature_digest(),
            module_update_interval_seconds: ConfigDefaults::module_update_interval_seconds(),
            signature_timeout_seconds: ConfigDefaults::signature_timeout_seconds(),
            hsm_modules: vec![],
        }
    }

    /// Creates the config from the command line options (at startup), and
    /// initialises logging.
    pub fn create() -> Result<Self, ConfigError> {
        let options = Options::parse();
        let config_file = options.config;

        let config = Self::read_config(&config_file).map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(),
                e
            ))
        })?;
        config.init_logging()?;
        info!(
            "{} uses configuration file: {}",
            TOKENSIGNER_SERVER_APP,
            config_file.display()
        );

        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(),
                e
            ))
        })?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.key_length < 2048 {
            return Err(ConfigError::other("key_length must be at least 2048"));
        }

        if self.module_update_interval_seconds == 0 {
            return Err(ConfigError::other(
                "module_update_interval_seconds must be at least 1",
            ));
        }

        if self.signature_timeout_seconds == 0 {
            return Err(ConfigError::other(
                "signature_timeout_seconds must be at least 1",
            ));
        }

        let mut names = HashSet::new();
        for module in &self.hsm_modules {
            if module.name.is_empty() {
                return Err(ConfigError::other("hsm module name must not be empty"));
            }
            if !names.insert(module.name.as_str()) {
                return Err(ConfigError::Other(format!(
                    "duplicate hsm module name '{}'",
                    module.name
                )));
            }
            SignAlgorithm::for_mechanism(&module.sign_mechanism, self.csr_signature_digest)
                .map_err(|e| {
                    ConfigError::Other(format!("hsm module '{}': {}", module.name, e))
                })?;
        }

        Ok(())
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut v = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut v)?;

        let c: Config = toml::from_str(&v)?;
        Ok(c)
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other(
                "syslog is only supported on unix systems",
            )),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: syslog::Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("tokensignerd"));
        let pid = std::process::id().try_into().unwrap_or_default();
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid,
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("mio", framework_level)
            .level_for("tokio", framework_level)
            .level_for("cryptoki", framework_level)
    }
}

fn deserialize_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string)
        .map_err(|_| de::Error::custom(format!("unknown log level: \"{}\"", string)))
}

//------------ ModuleConf ----------------------------------------------------

/// Configuration of one PKCS#11 hardware module.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ModuleConf {
    /// The module type name, part of the ids of its tokens.
    pub name: String,

    /// Path to the PKCS#11 library.
    pub lib: PathBuf,

    #[serde(default = "ConfigDefaults::sign_mechanism")]
    pub sign_mechanism: String,

    #[serde(default = "ConfigDefaults::batch_signing_enabled")]
    pub batch_signing_enabled: bool,

    /// Treat all tokens of this module as write protected.
    #[serde(default)]
    pub read_only: bool,

    #[serde(default = "ConfigDefaults::token_id_format")]
    pub token_id_format: String,
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found : \"{}\"",
                string
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------
