//! Global configuration.
//!
//! [`Config`] holds the process-wide defaults and can be loaded from a JSON,
//! TOML or YAML file. A [`ConfigStore`] wraps one behind a lock together with
//! the environment layer, and is what settings are resolved against:
//!
//! ```text
//! call-site Options  >  FANOUT_* environment  >  Config  >  built-in defaults
//! ```
//!
//! Every update is validated before it becomes visible; a rejected update
//! leaves the previous configuration in place.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    sync::{PoisonError, RwLock},
};
use tracing::level_filters::LevelFilter;

use crate::{
    error::{Error, Result},
    rate::RateLimit,
    settings::{DEFAULT_BATCH_SIZE, DEFAULT_WORKERS, ExecutionSettings, ExecutorKind, Options},
};

pub const ENV_CONFIG: &str = "FANOUT_CONFIG";
pub const ENV_LOG_LEVEL: &str = "FANOUT_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub execution: ExecutionConfig,
    /// Applied to every dispatcher that does not set its own.
    pub rate_limit: Option<RateLimit>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            rate_limit: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub executor: ExecutorKind,
    pub prewarm: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            executor: ExecutorKind::Thread,
            prewarm: false,
        }
    }
}

impl Config {
    /// Loads and validates a configuration file. The format follows the
    /// extension: `.json`, `.toml`, `.yaml` or `.yml`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_error = |message: String| Error::ConfigFile {
            path: path.to_path_buf(),
            message,
        };

        let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config: Config = match extension.as_deref() {
            Some("json") => serde_json::from_str(&text).map_err(|e| file_error(e.to_string()))?,
            Some("toml") => toml::from_str(&text).map_err(|e| file_error(e.to_string()))?,
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&text).map_err(|e| file_error(e.to_string()))?
            }
            _ => {
                return Err(file_error(
                    "unsupported format, expected .json, .toml, .yaml or .yml".to_string(),
                ));
            }
        };
        config
            .validate()
            .map_err(|e| file_error(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.workers == 0 {
            return Err(Error::config("execution.workers must be at least 1"));
        }
        if self.execution.batch_size == 0 {
            return Err(Error::config("execution.batch_size must be at least 1"));
        }
        parse_level(&self.log_level)?;
        Ok(())
    }

    /// The configuration as a fully populated option layer.
    pub fn as_options(&self) -> Options {
        Options {
            workers: Some(self.execution.workers),
            batch_size: Some(self.execution.batch_size),
            executor: Some(self.execution.executor),
            rate_limit: self.rate_limit,
            prewarm: Some(self.execution.prewarm),
        }
    }
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("unknown log level {level:?}")))
}

/// Shared, validated configuration plus the environment layer.
#[derive(Debug, Default)]
pub struct ConfigStore {
    config: RwLock<Config>,
    env: Options,
    env_log_level: Option<String>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_env(config, Options::default())
    }

    /// A store whose environment layer is `env` instead of the real
    /// environment.
    pub fn with_env(config: Config, env: Options) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            env,
            env_log_level: None,
        })
    }

    /// Builds a store from the process environment.
    ///
    /// `FANOUT_CONFIG` names an optional configuration file; the other
    /// `FANOUT_*` variables form the environment layer.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over arbitrary key/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().trim().to_string()))
            .filter(|(k, v)| k.starts_with("FANOUT_") && !v.is_empty())
            .collect();

        let config = match vars.get(ENV_CONFIG) {
            Some(path) => {
                tracing::debug!(path, "Loading configuration file");
                Config::from_file(path)?
            }
            None => Config::default(),
        };
        let env_log_level = match vars.get(ENV_LOG_LEVEL) {
            Some(level) => {
                parse_level(level).map_err(|_| {
                    Error::config(format!("{ENV_LOG_LEVEL}: unknown log level {level:?}"))
                })?;
                Some(level.clone())
            }
            None => None,
        };
        let env = Options::from_vars(&vars)?;
        if !env.is_empty() {
            tracing::debug!(?env, "Environment overrides execution settings");
        }

        let mut store = Self::with_env(config, env)?;
        store.env_log_level = env_log_level;
        Ok(store)
    }

    /// A copy of the current configuration.
    pub fn snapshot(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The environment layer this store was built with.
    pub fn env(&self) -> &Options {
        &self.env
    }

    /// Applies `change` to a copy of the configuration and installs it if it
    /// validates.
    pub fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = config.clone();
        change(&mut next);
        next.validate()?;
        *config = next;
        tracing::debug!(config = ?*config, "Configuration updated");
        Ok(())
    }

    /// Restores the built-in defaults. The environment layer is kept.
    pub fn reset(&self) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Config::default();
    }

    /// Effective log level: `FANOUT_LOG_LEVEL` if set, else the configured one.
    pub fn log_level(&self) -> String {
        self.env_log_level
            .clone()
            .unwrap_or_else(|| self.snapshot().log_level)
    }

    /// Resolves `options` into validated settings.
    ///
    /// Settings that are valid but unusual are logged as warnings.
    pub fn resolve(&self, options: &Options) -> Result<ExecutionSettings> {
        let merged = options.or(&self.env).or(&self.snapshot().as_options());
        let defaults = ExecutionSettings::default();
        let settings = ExecutionSettings {
            workers: merged.workers.unwrap_or(defaults.workers),
            batch_size: merged.batch_size.unwrap_or(defaults.batch_size),
            executor: merged.executor.unwrap_or(defaults.executor),
            rate_limit: merged.rate_limit,
            prewarm: merged.prewarm.unwrap_or(defaults.prewarm),
        };
        settings.validate()?;
        for warning in settings.warnings() {
            tracing::warn!("{warning}");
        }
        tracing::trace!(?settings, "Resolved execution settings");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(env: Options) -> ConfigStore {
        ConfigStore::with_env(Config::default(), env).unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = store(Options::default())
            .resolve(&Options::default())
            .unwrap();
        assert_eq!(settings, ExecutionSettings::default());
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.batch_size, 10);
    }

    #[test]
    fn precedence_is_call_site_env_config() {
        let store = store(Options::builder().workers(6).batch_size(20).build());
        store
            .update(|cfg| {
                cfg.execution.workers = 2;
                cfg.execution.batch_size = 3;
                cfg.execution.prewarm = true;
            })
            .unwrap();

        let settings = store
            .resolve(&Options::builder().workers(9).build())
            .unwrap();
        assert_eq!(settings.workers, 9);
        assert_eq!(settings.batch_size, 20);
        assert!(settings.prewarm);
    }

    #[test]
    fn global_rate_limit_is_inherited() {
        let store = store(Options::default());
        let limit = RateLimit::per_minute(30.0).unwrap();
        store.update(|cfg| cfg.rate_limit = Some(limit)).unwrap();
        let settings = store.resolve(&Options::default()).unwrap();
        assert_eq!(settings.rate_limit, Some(limit));
    }

    #[test]
    fn rejected_updates_are_rolled_back() {
        let store = store(Options::default());
        let err = store
            .update(|cfg| {
                cfg.execution.workers = 0;
                cfg.execution.batch_size = 99;
            })
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(store.snapshot(), Config::default());
    }

    #[test]
    fn invalid_call_site_options_are_config_errors() {
        let err = store(Options::default())
            .resolve(&Options::builder().workers(0).build())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn reset_restores_defaults() {
        let store = store(Options::default());
        store.update(|cfg| cfg.execution.workers = 12).unwrap();
        store.reset();
        assert_eq!(store.snapshot().execution.workers, 4);
    }

    #[test]
    fn log_level_from_env_wins() {
        let store = ConfigStore::from_vars([("FANOUT_LOG_LEVEL", "debug")]).unwrap();
        assert_eq!(store.log_level(), "debug");

        let store = ConfigStore::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(store.log_level(), "info");

        assert!(ConfigStore::from_vars([("FANOUT_LOG_LEVEL", "chatty")]).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let config = Config {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert!(ConfigStore::new(config).is_err());
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"execution": {"workers": 16}}"#).unwrap();
        assert_eq!(config.execution.workers, 16);
        assert_eq!(config.execution.batch_size, 10);
        assert_eq!(config.log_level, "info");
    }
}
