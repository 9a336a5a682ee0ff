use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub advertise: AdvertiseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Where the Jellyfin server actually lives. `url` applies to both
/// address families unless a per-family URL overrides it.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    pub url_v4: Option<String>,
    pub url_v6: Option<String>,
}

/// What address to hand back to discovery clients. Defaults to the
/// upstream URL of the same family when unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdvertiseConfig {
    pub url: Option<String>,
    pub url_v4: Option<String>,
    pub url_v6: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Hours to serve a cached identity before re-fetching. 0 caches
    /// until process restart.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Comma-separated blacklist: literal IPs and CIDR subnets.
    #[serde(default)]
    pub blacklist: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,
}

fn default_upstream_url() -> String {
    "http://localhost:8096".to_string()
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_discovery_port() -> u16 {
    7359
}

fn default_api_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            url_v4: None,
            url_v6: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_discovery_port(),
            blacklist: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
        }
    }
}

/// Fully-normalized per-family URLs the core consumes. The core never
/// sees the raw config fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyUrls {
    pub upstream_v4: String,
    pub upstream_v6: String,
    pub advertise_v4: String,
    pub advertise_v6: String,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Resolve the per-family URL fallbacks: a missing per-family upstream
    /// URL falls back to the other family's (or the legacy single URL), a
    /// missing advertise URL falls back to the same family's upstream URL,
    /// and trailing slashes are stripped everywhere.
    pub fn family_urls(&self) -> FamilyUrls {
        let (upstream_v4, upstream_v6) = match (&self.upstream.url_v4, &self.upstream.url_v6) {
            (Some(v4), Some(v6)) => (v4.clone(), v6.clone()),
            (Some(v4), None) => (v4.clone(), v4.clone()),
            (None, Some(v6)) => (v6.clone(), v6.clone()),
            (None, None) => (self.upstream.url.clone(), self.upstream.url.clone()),
        };

        let advertise_v4 = self
            .advertise
            .url_v4
            .clone()
            .or_else(|| self.advertise.url.clone())
            .unwrap_or_else(|| upstream_v4.clone());
        let advertise_v6 = self
            .advertise
            .url_v6
            .clone()
            .or_else(|| self.advertise.url.clone())
            .unwrap_or_else(|| upstream_v6.clone());

        let trim = |s: String| s.trim_end_matches('/').to_string();
        FamilyUrls {
            upstream_v4: trim(upstream_v4),
            upstream_v6: trim(upstream_v6),
            advertise_v4: trim(advertise_v4),
            advertise_v6: trim(advertise_v6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.ttl_hours, 24);
        assert_eq!(config.discovery.port, 7359);
        assert_eq!(config.discovery.bind_ip, "0.0.0.0");
        assert_eq!(config.api.listen, "0.0.0.0:8080");

        let urls = config.family_urls();
        assert_eq!(urls.upstream_v4, "http://localhost:8096");
        assert_eq!(urls.advertise_v4, urls.upstream_v4);
        assert_eq!(urls.upstream_v6, urls.upstream_v4);
    }

    #[test]
    fn legacy_single_url_feeds_both_families() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            url = "http://media.lan:8096/"
            "#,
        )
        .unwrap();

        let urls = config.family_urls();
        assert_eq!(urls.upstream_v4, "http://media.lan:8096");
        assert_eq!(urls.upstream_v6, "http://media.lan:8096");
    }

    #[test]
    fn per_family_urls_fall_back_to_each_other() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            url_v6 = "http://[fd00::5]:8096"
            "#,
        )
        .unwrap();

        let urls = config.family_urls();
        assert_eq!(urls.upstream_v4, "http://[fd00::5]:8096");
        assert_eq!(urls.upstream_v6, "http://[fd00::5]:8096");
    }

    #[test]
    fn advertise_url_defaults_to_same_family_upstream() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            url_v4 = "http://10.0.0.5:8096"
            url_v6 = "http://[fd00::5]:8096"

            [advertise]
            url_v4 = "http://jellyfin.example.com:8096"
            "#,
        )
        .unwrap();

        let urls = config.family_urls();
        assert_eq!(urls.advertise_v4, "http://jellyfin.example.com:8096");
        assert_eq!(urls.advertise_v6, "http://[fd00::5]:8096");
    }

    #[test]
    fn blacklist_and_cache_settings_parse() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            ttl_hours = 0

            [discovery]
            blacklist = "10.0.0.0/8,192.168.1.5"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl_hours, 0);
        assert_eq!(config.discovery.blacklist, "10.0.0.0/8,192.168.1.5");
    }
}
