//! # Configuration
//!
//! Flat `key = value` configuration backing the router's tunable knobs and
//! the runtime `set_config`/`get_config` surface. Files use the classic
//! daemon-conf dialect: `#` and `;` start comments, `[section]` headers are
//! tolerated and flattened into `section.key`.
//!
//! Every key has a default; typed accessors fall back to the default with a
//! logged warning when a value does not parse, so a bad config line degrades
//! one knob instead of refusing to start the router.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::time::Duration;
use tracing::warn;

/// Per-direction tunnel hop count. Clamped to `1..=4` by the engine.
pub const DEFAULT_TUNNEL_LENGTH: usize = 2;

/// Fixed client tunnel lifetime, seconds.
pub const DEFAULT_TUNNEL_LIFETIME_SECS: u64 = 600;

/// Replacement margin before expiry, seconds.
pub const DEFAULT_REPLACEMENT_MARGIN_SECS: u64 = 120;

/// Default local proxy ports, matching the classic router defaults.
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 4444;
pub const DEFAULT_SOCKS_PROXY_PORT: u16 = 4447;

const DEFAULTS: &[(&str, &str)] = &[
    ("host", "0.0.0.0"),
    ("port", "0"),
    ("bandwidth.interval", "60"),
    ("tunnel.length", "2"),
    ("tunnel.lifetime", "600"),
    ("tunnel.build-timeout", "10"),
    ("tunnel.build-retries", "2"),
    ("netdb.ttl", "3600"),
    ("httpproxy.port", "4444"),
    ("socksproxy.port", "4447"),
    ("session.idle-timeout", "120"),
    ("logbuffer.lines", "1000"),
];

/// Router configuration: defaults overlaid by a conf file overlaid by
/// runtime `set` calls.
#[derive(Clone, Debug)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let values = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { values }
    }
}

impl Config {
    /// Load a conf file over the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Parse conf text over the defaults. Unknown keys are kept; they are
    /// reachable through `get` even when the router itself ignores them.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        let mut section = String::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = lineno + 1, "ignoring config line without '='");
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                warn!(line = lineno + 1, "ignoring config line with empty key");
                continue;
            }
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", section, key)
            };
            config.values.insert(full_key, value.trim().to_string());
        }

        config
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Parse a key as `T`, falling back to the compiled-in default when the
    /// value is absent or malformed.
    fn typed<T: std::str::FromStr>(&self, key: &str) -> T {
        let fallback = DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or("");
        let raw = self.get(key).unwrap_or(fallback);
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = raw, fallback, "unparseable config value, using default");
                fallback
                    .parse()
                    .unwrap_or_else(|_| panic!("compiled-in default for {key} must parse"))
            }
        }
    }

    pub fn host(&self) -> String {
        self.get("host").unwrap_or("0.0.0.0").to_string()
    }

    pub fn port(&self) -> u16 {
        self.typed("port")
    }

    pub fn bandwidth_interval(&self) -> Duration {
        Duration::from_secs(self.typed::<u64>("bandwidth.interval").max(1))
    }

    pub fn tunnel_length(&self) -> usize {
        self.typed("tunnel.length")
    }

    pub fn tunnel_lifetime(&self) -> Duration {
        Duration::from_secs(self.typed::<u64>("tunnel.lifetime").max(1))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.typed::<u64>("tunnel.build-timeout").max(1))
    }

    pub fn build_retries(&self) -> u32 {
        self.typed("tunnel.build-retries")
    }

    pub fn netdb_ttl_secs(&self) -> u64 {
        self.typed::<u64>("netdb.ttl").max(1)
    }

    pub fn http_proxy_port(&self) -> u16 {
        self.typed("httpproxy.port")
    }

    pub fn socks_proxy_port(&self) -> u16 {
        self.typed("socksproxy.port")
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.typed::<u64>("session.idle-timeout").max(1))
    }

    pub fn log_buffer_lines(&self) -> usize {
        self.typed::<usize>("logbuffer.lines").max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_knob() {
        let config = Config::default();
        assert_eq!(config.host(), "0.0.0.0");
        assert_eq!(config.port(), 0);
        assert_eq!(config.tunnel_length(), DEFAULT_TUNNEL_LENGTH);
        assert_eq!(
            config.tunnel_lifetime(),
            Duration::from_secs(DEFAULT_TUNNEL_LIFETIME_SECS)
        );
        assert_eq!(config.build_timeout(), Duration::from_secs(10));
        assert_eq!(config.build_retries(), 2);
        assert_eq!(config.netdb_ttl_secs(), 3600);
        assert_eq!(config.http_proxy_port(), DEFAULT_HTTP_PROXY_PORT);
        assert_eq!(config.socks_proxy_port(), DEFAULT_SOCKS_PROXY_PORT);
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.log_buffer_lines(), 1000);
        assert_eq!(config.bandwidth_interval(), Duration::from_secs(60));
    }

    #[test]
    fn parse_flattens_sections_and_skips_comments() {
        let config = Config::parse(
            "# daemon config\n\
             port = 12345\n\
             ; another comment style\n\
             [httpproxy]\n\
             port = 8080\n\
             [socksproxy]\n\
             port = 8081\n",
        );

        assert_eq!(config.port(), 12345);
        assert_eq!(config.http_proxy_port(), 8080);
        assert_eq!(config.socks_proxy_port(), 8081);
        // Untouched keys keep their defaults
        assert_eq!(config.tunnel_length(), 2);
    }

    #[test]
    fn malformed_value_falls_back_to_default() {
        let config = Config::parse("tunnel.length = banana\nport = -7\n");
        assert_eq!(config.tunnel_length(), DEFAULT_TUNNEL_LENGTH);
        assert_eq!(config.port(), 0);
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let config = Config::parse("no equals sign here\n = emptykey\nport=9\n");
        assert_eq!(config.port(), 9);
    }

    #[test]
    fn set_and_get_runtime_values() {
        let mut config = Config::default();
        assert_eq!(config.get("custom.key"), None);

        config.set("custom.key", "hello");
        assert_eq!(config.get("custom.key"), Some("hello"));

        config.set("tunnel.length", "3");
        assert_eq!(config.tunnel_length(), 3);
    }

    #[test]
    fn unknown_file_keys_are_preserved() {
        let config = Config::parse("[meshnets]\nenabled = true\n");
        assert_eq!(config.get("meshnets.enabled"), Some("true"));
    }
}
