//! Worker configuration.
//!
//! Built programmatically or read from JSON. JSON input is validated eagerly
//! and field by field so a broken configuration fails at worker startup
//! with a message naming the offending field.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::{Map, Value as JsonValue};
use swkit_common::{LogLevel, ParseLogLevelError};
use thiserror::Error;

use crate::actions::{Action, Ping};
use crate::policy::{CachePolicy, DefaultPolicy};
use crate::urls::{UrlConfig, UrlConfigs, UrlDirectives};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} should be {expected}, got {got}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
        got: String,
    },

    #[error("config.cachePrefix must not be empty")]
    EmptyCachePrefix,

    #[error(transparent)]
    LogLevel(#[from] ParseLogLevelError),

    #[error("invalid config for {url}: {reason}")]
    InvalidUrlConfig { url: String, reason: String },

    #[error("cannot resolve {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("config is not valid JSON: {0}")]
    Json(String),
}

/// Everything the worker needs at startup.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Prefix shared by every cache this worker family creates.
    pub cache_prefix: String,
    /// URL configuration emitted by the build.
    pub generated_urls: UrlConfigs,
    /// URL configuration written by hand. Wins over `generated_urls`.
    pub manual_urls: UrlConfigs,
    pub log_level: LogLevel,
    pub logs_background_color: String,
    pub navigation_preload_enabled: bool,
    pub policy: Arc<dyn CachePolicy>,
    /// Extra message actions. They shadow built-in actions of the same name.
    pub actions: HashMap<String, Arc<dyn Action>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut actions: HashMap<String, Arc<dyn Action>> = HashMap::new();
        actions.insert("ping".to_string(), Arc::new(Ping));

        Self {
            cache_prefix: "jsenv".to_string(),
            generated_urls: Vec::new(),
            manual_urls: vec![("/".to_string(), UrlDirectives::default().into())],
            log_level: LogLevel::Warn,
            logs_background_color: "#ffdc00".to_string(),
            navigation_preload_enabled: false,
            policy: Arc::new(DefaultPolicy),
            actions,
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        actions.sort_unstable();

        f.debug_struct("WorkerConfig")
            .field("cache_prefix", &self.cache_prefix)
            .field("generated_urls", &self.generated_urls)
            .field("manual_urls", &self.manual_urls)
            .field("log_level", &self.log_level)
            .field("logs_background_color", &self.logs_background_color)
            .field("navigation_preload_enabled", &self.navigation_preload_enabled)
            .field("policy", &self.policy)
            .field("actions", &actions)
            .finish()
    }
}

impl WorkerConfig {
    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    /// Replace the manual URL configuration.
    pub fn with_manual_urls<I, K>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = (K, UrlConfig)>,
        K: Into<String>,
    {
        self.manual_urls = urls.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Replace the generated URL configuration.
    pub fn with_generated_urls<I, K>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = (K, UrlConfig)>,
        K: Into<String>,
    {
        self.generated_urls = urls.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_navigation_preload(mut self, enabled: bool) -> Self {
        self.navigation_preload_enabled = enabled;
        self
    }

    pub fn with_policy(mut self, policy: impl CachePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, action: impl Action + 'static) -> Self {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    /// Check invariants the type system does not express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_prefix.is_empty() {
            return Err(ConfigError::EmptyCachePrefix);
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let value: JsonValue =
            serde_json::from_str(input).map_err(|e| ConfigError::Json(e.to_string()))?;
        Self::from_json(&value)
    }

    /// Read the serializable part of the configuration from JSON.
    ///
    /// Recognised fields are `generatedUrlsConfig` (optional),
    /// `manualUrlsConfig`, `cachePrefix`, `logLevel`, `logsBackgroundColor`
    /// and `navigationPreloadEnabled`. Policy and actions keep their
    /// defaults and are set with [`WorkerConfig::with_policy`] and
    /// [`WorkerConfig::with_action`].
    pub fn from_json(value: &JsonValue) -> Result<Self, ConfigError> {
        let object = value.as_object().ok_or_else(|| ConfigError::InvalidType {
            field: "config",
            expected: "an object",
            got: describe(Some(value)),
        })?;

        let generated_urls = match object.get("generatedUrlsConfig") {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Object(map)) => read_url_configs(map)?,
            Some(other) => {
                return Err(ConfigError::InvalidType {
                    field: "self.generatedUrlsConfig",
                    expected: "an object",
                    got: describe(Some(other)),
                })
            }
        };

        let manual_urls = match object.get("manualUrlsConfig") {
            Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Object(map)) => read_url_configs(map)?,
            other => {
                return Err(ConfigError::InvalidType {
                    field: "config.manualUrlsConfig",
                    expected: "an object",
                    got: describe(other),
                })
            }
        };

        let cache_prefix = read_string(object, "cachePrefix", "config.cachePrefix")?;
        if cache_prefix.is_empty() {
            return Err(ConfigError::EmptyCachePrefix);
        }

        let log_level: LogLevel = read_string(object, "logLevel", "config.logLevel")?.parse()?;
        let logs_background_color =
            read_string(object, "logsBackgroundColor", "config.logsBackgroundColor")?;

        let navigation_preload_enabled = match object.get("navigationPreloadEnabled") {
            Some(JsonValue::Bool(enabled)) => *enabled,
            other => {
                return Err(ConfigError::InvalidType {
                    field: "config.navigationPreloadEnabled",
                    expected: "a boolean",
                    got: describe(other),
                })
            }
        };

        let config = Self {
            cache_prefix,
            generated_urls,
            manual_urls,
            log_level,
            logs_background_color,
            navigation_preload_enabled,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_string(
    object: &Map<String, JsonValue>,
    key: &str,
    field: &'static str,
) -> Result<String, ConfigError> {
    match object.get(key) {
        Some(JsonValue::String(s)) => Ok(s.clone()),
        other => Err(ConfigError::InvalidType {
            field,
            expected: "a string",
            got: describe(other),
        }),
    }
}

fn read_url_configs(map: &Map<String, JsonValue>) -> Result<UrlConfigs, ConfigError> {
    map.iter()
        .map(|(url, value)| {
            let config = match value {
                JsonValue::Null => UrlConfig::Flag(false),
                other => serde_json::from_value(other.clone()).map_err(|e| {
                    ConfigError::InvalidUrlConfig {
                        url: url.clone(),
                        reason: e.to_string(),
                    }
                })?,
            };
            Ok((url.clone(), config))
        })
        .collect()
}

fn describe(value: Option<&JsonValue>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
