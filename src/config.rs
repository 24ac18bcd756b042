//! Connection settings for the editor link.
//!
//! Defaults match the editor plugin's out-of-the-box listener. Every value
//! can be overridden from the environment with [`LinkConfig::from_env`].

use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Default port the editor plugin listens on.
pub const DEFAULT_PORT: u16 = 9080;

/// Default WebSocket subprotocol requested during the handshake.
pub const DEFAULT_SUBPROTOCOL: &str = "json";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_secs(1);
const DEFAULT_FIXED_DELAY: Duration = Duration::from_secs(2);

const ENV_URL: &str = "EDITOR_LINK_URL";
const ENV_PORT: &str = "EDITOR_LINK_PORT";
const ENV_SUBPROTOCOL: &str = "EDITOR_LINK_SUBPROTOCOL";
const ENV_COMMAND_TIMEOUT: &str = "EDITOR_LINK_COMMAND_TIMEOUT_MS";
const ENV_CONNECT_TIMEOUT: &str = "EDITOR_LINK_CONNECT_TIMEOUT_MS";
const ENV_HEARTBEAT: &str = "EDITOR_LINK_HEARTBEAT_MS";
const ENV_RECONNECT: &str = "EDITOR_LINK_RECONNECT";
const ENV_BACKOFF_INITIAL: &str = "EDITOR_LINK_BACKOFF_INITIAL_MS";
const ENV_BACKOFF_MAX: &str = "EDITOR_LINK_BACKOFF_MAX_MS";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// How the link retries after the connection drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Delays double from `initial` up to `max`, each with a random
    /// addition of at most `max_jitter`.
    Exponential {
        initial: Duration,
        max: Duration,
        max_jitter: Duration,
    },
    /// Every retry waits the same delay.
    Fixed { delay: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Exponential {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
            max_jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

/// Settings for one [`EditorLink`](crate::link::EditorLink).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// WebSocket endpoint of the editor plugin.
    pub endpoint: Url,
    /// Subprotocol requested in the handshake, if any.
    pub subprotocol: Option<String>,
    /// How long a command may wait for its reply.
    pub command_timeout: Duration,
    /// How long opening the socket may take.
    pub connect_timeout: Duration,
    /// Ping interval while connected; `None` disables pings.
    pub heartbeat_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::for_port(DEFAULT_PORT)
    }
}

impl LinkConfig {
    /// Configuration for an editor listening on localhost at `port`.
    pub fn for_port(port: u16) -> Self {
        let endpoint = Url::parse(&format!("ws://127.0.0.1:{}", port))
            .expect("loopback URL is always valid");
        Self::with_endpoint(endpoint)
    }

    /// Configuration for an arbitrary endpoint, using default timings.
    pub fn with_endpoint(endpoint: Url) -> Self {
        Self {
            endpoint,
            subprotocol: Some(DEFAULT_SUBPROTOCOL.to_string()),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Parse and validate a `ws://` or `wss://` endpoint.
    pub fn parse_endpoint(value: &str) -> Result<Url, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(value).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid("scheme must be ws or wss"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(url)
    }

    /// Build a configuration from `EDITOR_LINK_*` environment variables.
    ///
    /// Unset variables keep their defaults. `EDITOR_LINK_URL` wins over
    /// `EDITOR_LINK_PORT` when both are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match (lookup(ENV_URL), lookup(ENV_PORT)) {
            (Some(url), _) => Self::with_endpoint(Self::parse_endpoint(&url)?),
            (None, Some(port)) => Self::for_port(parse_number(ENV_PORT, &port)?),
            (None, None) => Self::default(),
        };

        if let Some(protocol) = lookup(ENV_SUBPROTOCOL) {
            let protocol = protocol.trim();
            config.subprotocol = (!protocol.is_empty()).then(|| protocol.to_string());
        }
        if let Some(ms) = lookup(ENV_COMMAND_TIMEOUT) {
            config.command_timeout = parse_millis(ENV_COMMAND_TIMEOUT, &ms)?;
        }
        if let Some(ms) = lookup(ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = parse_millis(ENV_CONNECT_TIMEOUT, &ms)?;
        }
        if let Some(ms) = lookup(ENV_HEARTBEAT) {
            let interval = parse_millis(ENV_HEARTBEAT, &ms)?;
            config.heartbeat_interval = (!interval.is_zero()).then_some(interval);
        }

        config.reconnect = match lookup(ENV_RECONNECT).as_deref().map(str::trim) {
            Some("fixed") => {
                let delay = match lookup(ENV_BACKOFF_INITIAL) {
                    Some(ms) => parse_retry_delay(ENV_BACKOFF_INITIAL, &ms)?,
                    None => DEFAULT_FIXED_DELAY,
                };
                ReconnectPolicy::Fixed { delay }
            }
            None | Some("exponential") => {
                let initial = match lookup(ENV_BACKOFF_INITIAL) {
                    Some(ms) => parse_retry_delay(ENV_BACKOFF_INITIAL, &ms)?,
                    None => DEFAULT_BACKOFF_INITIAL,
                };
                let max = match lookup(ENV_BACKOFF_MAX) {
                    Some(ms) => parse_millis(ENV_BACKOFF_MAX, &ms)?,
                    None => DEFAULT_BACKOFF_MAX,
                };
                if max < initial {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_BACKOFF_MAX,
                        value: format!("{} (below initial delay)", max.as_millis()),
                    });
                }
                ReconnectPolicy::Exponential {
                    initial,
                    max,
                    max_jitter: DEFAULT_BACKOFF_JITTER,
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: ENV_RECONNECT,
                    value: other.to_string(),
                })
            }
        };

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

/// Retry delays must be non-zero, otherwise backoff never grows.
fn parse_retry_delay(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let delay = parse_millis(key, value)?;
    if delay.is_zero() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.endpoint.as_str(), "ws://127.0.0.1:9080/");
        assert_eq!(config.subprotocol.as_deref(), Some("json"));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(3)));
        assert!(matches!(config.reconnect, ReconnectPolicy::Exponential { .. }));
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = LinkConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.endpoint, LinkConfig::default().endpoint);
    }

    #[test]
    fn test_port_override() {
        let config = LinkConfig::from_lookup(lookup_from(&[("EDITOR_LINK_PORT", "6505")])).unwrap();
        assert_eq!(config.endpoint.port(), Some(6505));
    }

    #[test]
    fn test_url_wins_over_port() {
        let config = LinkConfig::from_lookup(lookup_from(&[
            ("EDITOR_LINK_URL", "ws://editor.local:7000"),
            ("EDITOR_LINK_PORT", "6505"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint.host_str(), Some("editor.local"));
        assert_eq!(config.endpoint.port(), Some(7000));
    }

    #[test]
    fn test_timings_and_heartbeat() {
        let config = LinkConfig::from_lookup(lookup_from(&[
            ("EDITOR_LINK_COMMAND_TIMEOUT_MS", "250"),
            ("EDITOR_LINK_CONNECT_TIMEOUT_MS", "100"),
            ("EDITOR_LINK_HEARTBEAT_MS", "0"),
            ("EDITOR_LINK_SUBPROTOCOL", ""),
        ]))
        .unwrap();
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.subprotocol, None);
    }

    #[test]
    fn test_fixed_reconnect_policy() {
        let config = LinkConfig::from_lookup(lookup_from(&[
            ("EDITOR_LINK_RECONNECT", "fixed"),
            ("EDITOR_LINK_BACKOFF_INITIAL_MS", "2000"),
        ]))
        .unwrap();
        assert_eq!(
            config.reconnect,
            ReconnectPolicy::Fixed {
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_scheme = LinkConfig::from_lookup(lookup_from(&[("EDITOR_LINK_URL", "http://x:1")]));
        assert!(matches!(bad_scheme, Err(ConfigError::InvalidEndpoint { .. })));

        let bad_port = LinkConfig::from_lookup(lookup_from(&[("EDITOR_LINK_PORT", "port")]));
        assert!(matches!(
            bad_port,
            Err(ConfigError::InvalidValue { key: "EDITOR_LINK_PORT", .. })
        ));

        let inverted = LinkConfig::from_lookup(lookup_from(&[
            ("EDITOR_LINK_BACKOFF_INITIAL_MS", "5000"),
            ("EDITOR_LINK_BACKOFF_MAX_MS", "1000"),
        ]));
        assert!(inverted.is_err());

        let unknown = LinkConfig::from_lookup(lookup_from(&[("EDITOR_LINK_RECONNECT", "never")]));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_rejects_zero_retry_delay() {
        let exponential =
            LinkConfig::from_lookup(lookup_from(&[("EDITOR_LINK_BACKOFF_INITIAL_MS", "0")]));
        assert!(matches!(
            exponential,
            Err(ConfigError::InvalidValue {
                key: "EDITOR_LINK_BACKOFF_INITIAL_MS",
                ..
            })
        ));

        let fixed = LinkConfig::from_lookup(lookup_from(&[
            ("EDITOR_LINK_RECONNECT", "fixed"),
            ("EDITOR_LINK_BACKOFF_INITIAL_MS", "0"),
        ]));
        assert!(matches!(
            fixed,
            Err(ConfigError::InvalidValue {
                key: "EDITOR_LINK_BACKOFF_INITIAL_MS",
                ..
            })
        ));
    }
}
