//! URL policy table built from generated and manual URL configuration.

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ConfigError;

/// Caching directives for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlDirectives {
    /// Put the URL in cache on install.
    pub cache: bool,
    /// Content at this URL never changes; the HTTP cache may be reused.
    pub versioned: bool,
    /// Serve requests for this URL from another URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Default for UrlDirectives {
    fn default() -> Self {
        Self {
            cache: true,
            versioned: false,
            alias: None,
        }
    }
}

impl UrlDirectives {
    pub fn versioned() -> Self {
        Self {
            versioned: true,
            ..Self::default()
        }
    }

    pub fn not_cached() -> Self {
        Self {
            cache: false,
            ..Self::default()
        }
    }

    /// Alias entry that is not itself pre-cached. A JSON `{"alias": ...}`
    /// object keeps the default `cache: true`.
    pub fn alias_only(target: impl Into<String>) -> Self {
        Self {
            cache: false,
            alias: Some(target.into()),
            ..Self::default()
        }
    }
}

/// One entry of `generatedUrlsConfig` / `manualUrlsConfig`.
///
/// `null` and `false` mean "do not cache", `true` means "cache", an object
/// spells the directives out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlConfig {
    Flag(bool),
    Directives(UrlDirectives),
}

impl UrlConfig {
    pub fn into_directives(self) -> UrlDirectives {
        match self {
            UrlConfig::Flag(cache) => UrlDirectives {
                cache,
                ..UrlDirectives::default()
            },
            UrlConfig::Directives(directives) => directives,
        }
    }
}

impl From<UrlDirectives> for UrlConfig {
    fn from(directives: UrlDirectives) -> Self {
        UrlConfig::Directives(directives)
    }
}

/// Ordered `url -> config` pairs as written by the user or the build.
pub type UrlConfigs = Vec<(String, UrlConfig)>;

/// Resolved caching directives, deduplicated by absolute URL.
#[derive(Debug, Clone, Default)]
pub struct UrlPolicyTable {
    cache_on_install: Vec<InstallUrl>,
    install_set: HashSet<String>,
    aliases: HashMap<String, Url>,
}

/// A URL fetched during install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallUrl {
    pub url: Url,
    pub versioned: bool,
}

impl UrlPolicyTable {
    /// Merge `generated` and `manual` (manual wins for identical keys),
    /// resolve every key against `base` and keep the first entry per
    /// resolved URL.
    pub fn build(
        base: &Url,
        generated: &UrlConfigs,
        manual: &UrlConfigs,
    ) -> Result<Self, ConfigError> {
        let mut merged: UrlConfigs = generated.clone();
        for (key, config) in manual {
            match merged.iter_mut().find(|(existing, _)| existing == key) {
                Some(slot) => slot.1 = config.clone(),
                None => merged.push((key.clone(), config.clone())),
            }
        }

        let mut table = Self::default();
        let mut seen = HashSet::new();

        for (key, config) in merged {
            let url = swkit_common::resolve_url(base, &key).map_err(|source| {
                ConfigError::InvalidUrl {
                    url: key.clone(),
                    source,
                }
            })?;
            if !seen.insert(url.as_str().to_string()) {
                continue;
            }

            let directives = config.into_directives();
            if directives.cache {
                table.install_set.insert(url.as_str().to_string());
                table.cache_on_install.push(InstallUrl {
                    url: url.clone(),
                    versioned: directives.versioned,
                });
            }
            if let Some(alias) = directives.alias {
                let target = swkit_common::resolve_url(base, &alias).map_err(|source| {
                    ConfigError::InvalidUrl {
                        url: alias.clone(),
                        source,
                    }
                })?;
                table.aliases.insert(url.as_str().to_string(), target);
            }
        }

        Ok(table)
    }

    /// URLs put in cache on install, in configuration order.
    pub fn urls_to_cache_on_install(&self) -> &[InstallUrl] {
        &self.cache_on_install
    }

    pub fn was_cached_on_install(&self, url: &str) -> bool {
        self.install_set.contains(url)
    }

    /// Alias target for `url`, if any.
    pub fn alias_for(&self, url: &str) -> Option<&Url> {
        self.aliases.get(url)
    }
}
