//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, num::NonZeroU64, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, StrategyKind};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "vaultcache";
const ENV_PREFIX: &str = "VAULTCACHE";
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SIMULATION_TRANSACTIONS: usize = 500;
const DEFAULT_SIMULATION_WORKERS: usize = 4;
const DEFAULT_SIMULATION_POSTS: usize = 8;
const DEFAULT_SIMULATION_FAILURE_RATE: f64 = 0.1;

/// Command-line arguments for the vaultcache binary.
#[derive(Debug, Parser)]
#[command(name = "vaultcache", version, about = "Transactional second-level cache toolkit")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VAULTCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a concurrent read/write workload against an in-memory store.
    Simulate(SimulateArgs),
    /// Print the resolved configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the soft-lock timeout in milliseconds.
    #[arg(long = "lock-timeout-ms", value_name = "MILLIS")]
    pub lock_timeout_ms: Option<u64>,

    /// Enable or disable the query result cache.
    #[arg(
        long = "query-cache",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub query_cache_enabled: Option<bool>,

    /// Enable or disable the collection cache.
    #[arg(
        long = "collection-cache",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub collection_cache_enabled: Option<bool>,

    /// Override the default concurrency strategy.
    #[arg(long = "strategy", value_name = "KIND")]
    pub default_strategy: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Number of logical transactions to run.
    #[arg(long, default_value_t = DEFAULT_SIMULATION_TRANSACTIONS)]
    pub transactions: usize,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = DEFAULT_SIMULATION_WORKERS)]
    pub workers: usize,

    /// Number of posts in the data set; fewer posts means more contention.
    #[arg(long, default_value_t = DEFAULT_SIMULATION_POSTS)]
    pub posts: usize,

    /// Fraction of write transactions that roll back (0.0..=1.0).
    #[arg(long = "failure-rate", default_value_t = DEFAULT_SIMULATION_FAILURE_RATE)]
    pub failure_rate: f64,

    /// Print the report as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            overrides: CacheOverrides::default(),
            transactions: DEFAULT_SIMULATION_TRANSACTIONS,
            workers: DEFAULT_SIMULATION_WORKERS,
            posts: DEFAULT_SIMULATION_POSTS,
            failure_rate: DEFAULT_SIMULATION_FAILURE_RATE,
            json: false,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub lock_timeout_ms: NonZeroU64,
    pub query_cache_enabled: bool,
    pub collection_cache_enabled: bool,
    pub default_strategy: StrategyKind,
    pub strategy_per_region: BTreeMap<String, StrategyKind>,
}

impl Settings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Simulate(args)) => raw.apply_overrides(&args.overrides),
        Some(Command::Config(args)) => raw.apply_overrides(&args.overrides),
        None => {}
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    lock_timeout_ms: Option<u64>,
    query_cache_enabled: Option<bool>,
    collection_cache_enabled: Option<bool>,
    default_strategy: Option<String>,
    strategy_per_region: BTreeMap<String, String>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(timeout) = overrides.lock_timeout_ms {
            self.cache.lock_timeout_ms = Some(timeout);
        }
        if let Some(enabled) = overrides.query_cache_enabled {
            self.cache.query_cache_enabled = Some(enabled);
        }
        if let Some(enabled) = overrides.collection_cache_enabled {
            self.cache.collection_cache_enabled = Some(enabled);
        }
        if let Some(strategy) = overrides.default_strategy.as_ref() {
            self.cache.default_strategy = Some(strategy.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let timeout = cache.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);
    let lock_timeout_ms = NonZeroU64::new(timeout)
        .ok_or_else(|| LoadError::invalid("cache.lock_timeout_ms", "must be greater than zero"))?;

    let default_strategy = match cache.default_strategy {
        Some(value) => value
            .parse()
            .map_err(|err| LoadError::invalid("cache.default_strategy", format!("{err}")))?,
        None => StrategyKind::ReadWrite,
    };

    let strategy_per_region = cache
        .strategy_per_region
        .into_iter()
        .map(|(region, value)| {
            let region = region.trim().to_string();
            if region.is_empty() {
                return Err(LoadError::invalid(
                    "cache.strategy_per_region",
                    "region name must not be empty",
                ));
            }
            let strategy = value.parse::<StrategyKind>().map_err(|err| {
                LoadError::invalid("cache.strategy_per_region", format!("region `{region}`: {err}"))
            })?;
            Ok((region, strategy))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(CacheSettings {
        lock_timeout_ms,
        query_cache_enabled: cache.query_cache_enabled.unwrap_or(true),
        collection_cache_enabled: cache.collection_cache_enabled.unwrap_or(true),
        default_strategy,
        strategy_per_region,
    })
}
