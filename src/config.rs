use serde::{Deserialize, Deserializer};
use std::convert::TryFrom;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::transport::{AuthScheme, Http503Verbosity, Timeouts};

/// Configuration for the accept engine.
///
/// Every field has a default. Values are read from an optional `kaccept`
/// config file and from environment variables with the "KACCEPT_" prefix;
/// nested keys use a double underscore, e.g. `KACCEPT_TIMEOUTS__HEADER_WAIT_SECS`.
/// List values may be given as a comma separated string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Concurrent accept loops. Defaults to CPU count * 5.
    #[serde(default = "default_max_accepts")]
    pub max_accepts: usize,
    /// Maximum number of dispatch threads. Defaults to CPU count * 15.
    #[serde(default = "default_max_dispatch_threads")]
    pub max_dispatch_threads: usize,
    /// Keep-alive duration in seconds for idle dispatch threads. Defaults to 6 seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub dispatch_keep_alive_secs: u64,
    /// Url prefixes to register. Defaults to "http://localhost:5000/".
    #[serde(default = "default_url_prefixes", deserialize_with = "comma_list")]
    pub url_prefixes: Vec<String>,
    /// Requests with more unknown headers than this get a 400. Defaults to 1000.
    #[serde(default = "default_max_unknown_headers")]
    pub max_unknown_headers: usize,
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    #[serde(default, deserialize_with = "comma_list")]
    pub authentication_schemes: Vec<AuthScheme>,
    /// Kernel request queue length. Defaults to 1000.
    #[serde(default = "default_request_queue_limit")]
    pub request_queue_limit: u64,
    #[serde(default)]
    pub max_connections: Option<u64>,
    #[serde(default)]
    pub http503_verbosity: Http503Verbosity,
    /// First receive buffer size in bytes. Defaults to 4096.
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,
    #[serde(default = "default_true")]
    pub skip_completion_on_success: bool,
    /// Drain deadline in seconds. Defaults to 5 seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Kernel timeouts in seconds; unset ones keep the kernel default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TimeoutSettings {
    pub entity_body_secs: Option<u64>,
    pub drain_entity_body_secs: Option<u64>,
    pub request_queue_secs: Option<u64>,
    pub idle_connection_secs: Option<u64>,
    pub header_wait_secs: Option<u64>,
    /// Bytes per second.
    pub min_send_rate: Option<u32>,
}

impl TimeoutSettings {
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            entity_body: self.entity_body_secs.map(Duration::from_secs),
            drain_entity_body: self.drain_entity_body_secs.map(Duration::from_secs),
            request_queue: self.request_queue_secs.map(Duration::from_secs),
            idle_connection: self.idle_connection_secs.map(Duration::from_secs),
            header_wait: self.header_wait_secs.map(Duration::from_secs),
            min_send_rate: self.min_send_rate,
        }
    }
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "kaccept" file (if it exists)
    /// 3. Override with environment variables prefixed with "KACCEPT_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("kaccept").required(false))
            .add_source(
                config::Environment::with_prefix("KACCEPT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_into()
    }

    pub fn dispatch_keep_alive(&self) -> Duration {
        Duration::from_secs(self.dispatch_keep_alive_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Accepts either a sequence or a comma separated string.
fn comma_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let items = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect(),
        OneOrMany::Many(items) => items,
    };
    items
        .iter()
        .map(|item| item.parse().map_err(serde::de::Error::custom))
        .collect()
}

fn default_max_accepts() -> usize {
    num_cpus::get() * 5
}

fn default_max_dispatch_threads() -> usize {
    num_cpus::get() * 15
}

fn default_keep_alive_secs() -> u64 {
    6
}

fn default_url_prefixes() -> Vec<String> {
    vec![crate::listener::DEFAULT_URL_PREFIX.to_owned()]
}

fn default_max_unknown_headers() -> usize {
    crate::listener::DEFAULT_MAX_UNKNOWN_HEADERS
}

fn default_true() -> bool {
    true
}

fn default_request_queue_limit() -> u64 {
    crate::listener::DEFAULT_REQUEST_QUEUE_LIMIT
}

fn default_initial_buffer_size() -> usize {
    crate::buffer::MIN_CLASS_SIZE
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_accepts: default_max_accepts(),
            max_dispatch_threads: default_max_dispatch_threads(),
            dispatch_keep_alive_secs: default_keep_alive_secs(),
            url_prefixes: default_url_prefixes(),
            max_unknown_headers: default_max_unknown_headers(),
            allow_anonymous: true,
            authentication_schemes: Vec::new(),
            request_queue_limit: default_request_queue_limit(),
            max_connections: None,
            http503_verbosity: Http503Verbosity::Basic,
            initial_buffer_size: default_initial_buffer_size(),
            skip_completion_on_success: true,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_accepts, num_cpus::get() * 5);
        assert_eq!(config.max_dispatch_threads, num_cpus::get() * 15);
        assert_eq!(config.url_prefixes, vec!["http://localhost:5000/".to_owned()]);
        assert_eq!(config.max_unknown_headers, 1000);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert!(config.skip_completion_on_success);
    }

    /// Tests that an empty source deserializes to the defaults.
    #[test]
    fn test_empty_source_uses_defaults() {
        let config: ServerConfig = config::Config::builder().build().unwrap().try_into().unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    /// Tests that list values accept both sequences and comma separated strings.
    #[test]
    fn test_list_values() {
        let config: ServerConfig = config::Config::builder()
            .set_override("url_prefixes", "http://+:80/a/, http://+:80/b/")
            .unwrap()
            .set_override("authentication_schemes", vec!["negotiate", "ntlm"])
            .unwrap()
            .build()
            .unwrap()
            .try_into()
            .unwrap();

        assert_eq!(config.url_prefixes, vec!["http://+:80/a/", "http://+:80/b/"]);
        assert_eq!(
            config.authentication_schemes,
            vec![AuthScheme::Negotiate, AuthScheme::Ntlm]
        );
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let result: Result<ServerConfig, _> = config::Config::builder()
            .set_override("authentication_schemes", "digest")
            .unwrap()
            .build()
            .unwrap()
            .try_into();
        assert!(result.is_err());
    }

    /// Tests configuration loading from environment variables with the
    /// "KACCEPT_" prefix, including a nested timeout.
    #[test]
    fn test_config_from_env() {
        env::set_var("KACCEPT_MAX_ACCEPTS", "4");
        env::set_var("KACCEPT_ALLOW_ANONYMOUS", "false");
        env::set_var("KACCEPT_HTTP503_VERBOSITY", "full");
        env::set_var("KACCEPT_TIMEOUTS__HEADER_WAIT_SECS", "9");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.max_accepts, 4);
        assert!(!config.allow_anonymous);
        assert_eq!(config.http503_verbosity, Http503Verbosity::Full);
        assert_eq!(
            config.timeouts.to_timeouts().header_wait,
            Some(Duration::from_secs(9))
        );

        // Cleanup
        env::remove_var("KACCEPT_MAX_ACCEPTS");
        env::remove_var("KACCEPT_ALLOW_ANONYMOUS");
        env::remove_var("KACCEPT_HTTP503_VERBOSITY");
        env::remove_var("KACCEPT_TIMEOUTS__HEADER_WAIT_SECS");
    }
}
