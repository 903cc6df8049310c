use serde::Deserialize;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_NAMESPACE: &str = "smartnoel";
const DEFAULT_CLIENT_PREFIX: &str = "noel-backend";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 4;
const DEFAULT_RECONNECT_MS: u64 = 1_000;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3001";
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;
const DEFAULT_GALLERY_REFRESH_SECS: u64 = 60;
const DEFAULT_OBSERVER_BUFFER: usize = 256;
const MAX_DEDUP_WINDOW_MS: u64 = 86_400_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read config file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    mqtt: Option<MqttFile>,
    http: Option<HttpFile>,
    store: Option<StoreFile>,
    dedup: Option<DedupFile>,
    matcher: Option<MatcherFile>,
    observers: Option<ObserversFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttFile {
    broker: Option<String>,
    username: Option<String>,
    password: Option<String>,
    namespace: Option<String>,
    client_prefix: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_ms: Option<u64>,
    keep_alive_secs: Option<u64>,
    publish_checkins: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HttpFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StoreFile {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DedupFile {
    window_ms: Option<u64>,
    restore: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MatcherFile {
    similarity_threshold: Option<f32>,
    refresh_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ObserversFile {
    buffer: Option<usize>,
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic namespace; subscriptions are `<namespace>/{face,pose,count}`.
    pub namespace: String,
    /// Client ids are `<prefix>-<random hex>`.
    pub client_prefix: String,
    pub connect_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval: Duration,
    pub keep_alive: Duration,
    /// Publish each recorded check-in back to `<namespace>/checkin`.
    pub publish_checkins: bool,
}

/// Daemon configuration: optional TOML file named by `NOEL_CONFIG`,
/// overridden by `NOEL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub http_addr: SocketAddr,
    pub db_path: PathBuf,
    pub dedup_window_ms: u64,
    /// Seed the dedup window from persisted check-ins at startup.
    pub dedup_restore: bool,
    pub similarity_threshold: f32,
    pub gallery_refresh: Duration,
    /// Per-observer queue depth before deltas are dropped for that observer.
    pub observer_buffer: usize,
}

/// Variable source; the process environment in production.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(key)
            .map(|raw| raw.parse::<T>().map_err(|e| invalid(key, format!("{raw:?}: {e}"))))
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, format!("{raw:?} is not a boolean"))),
            })
            .transpose()
    }
}

impl Config {
    /// Load from the process environment. Any error here is fatal: the
    /// daemon must not start half-configured.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };
        let file = match vars.string("NOEL_CONFIG") {
            Some(path) => read_config_file(Path::new(&path))?,
            None => ConfigFile::default(),
        };
        let mqtt_file = file.mqtt.unwrap_or_default();
        let dedup_file = file.dedup.unwrap_or_default();
        let matcher_file = file.matcher.unwrap_or_default();

        let broker = vars
            .string("NOEL_MQTT_BROKER")
            .or(mqtt_file.broker)
            .ok_or(ConfigError::Missing("NOEL_MQTT_BROKER"))?;
        let (host, port) = parse_broker(&broker)?;

        let username = vars.string("NOEL_MQTT_USERNAME").or(mqtt_file.username);
        let password = vars.string("NOEL_MQTT_PASSWORD").or(mqtt_file.password);

        let mqtt = MqttSettings {
            host,
            port,
            username,
            password,
            namespace: vars
                .string("NOEL_MQTT_NAMESPACE")
                .or(mqtt_file.namespace)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            client_prefix: vars
                .string("NOEL_MQTT_CLIENT_PREFIX")
                .or(mqtt_file.client_prefix)
                .unwrap_or_else(|| DEFAULT_CLIENT_PREFIX.to_string()),
            connect_timeout: Duration::from_secs(
                vars.parsed("NOEL_MQTT_CONNECT_TIMEOUT_SECS")?
                    .or(mqtt_file.connect_timeout_secs)
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            reconnect_interval: Duration::from_millis(
                vars.parsed("NOEL_MQTT_RECONNECT_MS")?
                    .or(mqtt_file.reconnect_ms)
                    .unwrap_or(DEFAULT_RECONNECT_MS),
            ),
            keep_alive: Duration::from_secs(
                vars.parsed("NOEL_MQTT_KEEP_ALIVE_SECS")?
                    .or(mqtt_file.keep_alive_secs)
                    .unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            ),
            publish_checkins: vars
                .flag("NOEL_PUBLISH_CHECKINS")?
                .or(mqtt_file.publish_checkins)
                .unwrap_or(true),
        };

        let http_addr_raw = vars
            .string("NOEL_HTTP_ADDR")
            .or(file.http.and_then(|h| h.addr))
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let http_addr = http_addr_raw
            .parse()
            .map_err(|e| invalid("NOEL_HTTP_ADDR", format!("{http_addr_raw:?}: {e}")))?;

        let db_path = vars
            .string("NOEL_DB_PATH")
            .map(PathBuf::from)
            .or(file.store.and_then(|s| s.db_path))
            .unwrap_or_else(noel_store::default_db_path);

        let cfg = Self {
            mqtt,
            http_addr,
            db_path,
            dedup_window_ms: vars
                .parsed("NOEL_DEDUP_WINDOW_MS")?
                .or(dedup_file.window_ms)
                .unwrap_or(noel_core::DEFAULT_DEDUP_WINDOW_MS),
            dedup_restore: vars
                .flag("NOEL_DEDUP_RESTORE")?
                .or(dedup_file.restore)
                .unwrap_or(false),
            similarity_threshold: vars
                .parsed("NOEL_SIMILARITY_THRESHOLD")?
                .or(matcher_file.similarity_threshold)
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            gallery_refresh: Duration::from_secs(
                vars.parsed("NOEL_GALLERY_REFRESH_SECS")?
                    .or(matcher_file.refresh_secs)
                    .unwrap_or(DEFAULT_GALLERY_REFRESH_SECS),
            ),
            observer_buffer: vars
                .parsed("NOEL_OBSERVER_BUFFER")?
                .or(file.observers.and_then(|o| o.buffer))
                .unwrap_or(DEFAULT_OBSERVER_BUFFER),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.username.is_some() && self.mqtt.password.is_none() {
            return Err(ConfigError::Missing("NOEL_MQTT_PASSWORD"));
        }
        if self.mqtt.namespace.contains(['+', '#']) || self.mqtt.namespace.ends_with('/') {
            return Err(invalid(
                "NOEL_MQTT_NAMESPACE",
                "must be a plain topic prefix without wildcards or trailing '/'",
            ));
        }
        if self.mqtt.connect_timeout.is_zero() {
            return Err(invalid("NOEL_MQTT_CONNECT_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.mqtt.reconnect_interval.is_zero() {
            return Err(invalid("NOEL_MQTT_RECONNECT_MS", "must be greater than zero"));
        }
        if self.mqtt.keep_alive.as_secs() < MIN_KEEP_ALIVE_SECS {
            return Err(invalid(
                "NOEL_MQTT_KEEP_ALIVE_SECS",
                format!("must be at least {MIN_KEEP_ALIVE_SECS}"),
            ));
        }
        if self.dedup_window_ms == 0 || self.dedup_window_ms > MAX_DEDUP_WINDOW_MS {
            return Err(invalid(
                "NOEL_DEDUP_WINDOW_MS",
                format!("must be between 1 and {MAX_DEDUP_WINDOW_MS} (one day)"),
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(invalid("NOEL_SIMILARITY_THRESHOLD", "must be in (0, 1]"));
        }
        if self.gallery_refresh.is_zero() {
            return Err(invalid("NOEL_GALLERY_REFRESH_SECS", "must be greater than zero"));
        }
        if self.observer_buffer == 0 {
            return Err(invalid("NOEL_OBSERVER_BUFFER", "must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let file_err = |reason: String| ConfigError::File {
        path: path.to_path_buf(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
    toml::from_str(&raw).map_err(|e| file_err(e.to_string()))
}

/// Parse `host`, `host:port`, `mqtt://host:port` or `tcp://host:port`.
/// TLS schemes are rejected; the daemon speaks plain MQTT only.
fn parse_broker(addr: &str) -> Result<(String, u16), ConfigError> {
    const KEY: &str = "NOEL_MQTT_BROKER";
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" | "wss" | "ws" => {
                return Err(invalid(KEY, format!("unsupported scheme {scheme}://")))
            }
            other => return Err(invalid(KEY, format!("unknown scheme {other}://"))),
        }
        remainder = rest;
    }
    let remainder = remainder.trim_end_matches('/');

    // [::1]:1883
    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| invalid(KEY, format!("unterminated IPv6 address in {addr}")))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if rest.is_empty() => DEFAULT_MQTT_PORT,
            None => return Err(invalid(KEY, format!("unexpected {rest:?} after host"))),
        };
        return Ok((host.to_string(), port));
    }

    let (host, port) = match remainder.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (remainder, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(invalid(KEY, format!("missing host in {addr:?}")));
    }
    Ok((host.to_string(), port))
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.parse()
        .map_err(|_| invalid("NOEL_MQTT_BROKER", format!("invalid port {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&move |key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_only_broker() {
        let cfg = load(&[("NOEL_MQTT_BROKER", "broker.emqx.io")]).unwrap();
        assert_eq!(cfg.mqtt.host, "broker.emqx.io");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.namespace, "smartnoel");
        assert_eq!(cfg.mqtt.connect_timeout, Duration::from_secs(4));
        assert_eq!(cfg.mqtt.reconnect_interval, Duration::from_millis(1_000));
        assert_eq!(cfg.dedup_window_ms, 30_000);
        assert!(!cfg.dedup_restore);
        assert!(cfg.mqtt.publish_checkins);
        assert_eq!(cfg.http_addr.port(), 3001);
    }

    #[test]
    fn test_missing_broker_is_fatal() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NOEL_MQTT_BROKER")));
    }

    #[test]
    fn test_username_requires_password() {
        let err = load(&[
            ("NOEL_MQTT_BROKER", "localhost"),
            ("NOEL_MQTT_USERNAME", "noel"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NOEL_MQTT_PASSWORD")));
    }

    #[test]
    fn test_unparseable_number_is_rejected() {
        let err = load(&[
            ("NOEL_MQTT_BROKER", "localhost"),
            ("NOEL_DEDUP_WINDOW_MS", "thirty seconds"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("NOEL_DEDUP_WINDOW_MS"));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = load(&[("NOEL_MQTT_BROKER", "localhost"), ("NOEL_DEDUP_WINDOW_MS", "0")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "NOEL_DEDUP_WINDOW_MS", .. }));
    }

    #[test]
    fn test_window_longer_than_a_day_rejected() {
        let err = load(&[
            ("NOEL_MQTT_BROKER", "localhost"),
            ("NOEL_DEDUP_WINDOW_MS", "18446744073709551615"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "NOEL_DEDUP_WINDOW_MS", .. }));

        let cfg = load(&[
            ("NOEL_MQTT_BROKER", "localhost"),
            ("NOEL_DEDUP_WINDOW_MS", "86400000"),
        ])
        .unwrap();
        assert_eq!(cfg.dedup_window_ms, 86_400_000);
    }

    #[test]
    fn test_file_values_with_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[mqtt]
broker = "mqtt://10.0.0.5:1884"
namespace = "lobby"
username = "edge"
password = "secret"

[dedup]
window_ms = 45000
restore = true

[observers]
buffer = 32
"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let cfg = load(&[
            ("NOEL_CONFIG", path.as_str()),
            ("NOEL_DEDUP_WINDOW_MS", "60000"),
            ("NOEL_PUBLISH_CHECKINS", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 1884);
        assert_eq!(cfg.mqtt.namespace, "lobby");
        assert_eq!(cfg.mqtt.username.as_deref(), Some("edge"));
        assert_eq!(cfg.dedup_window_ms, 60_000);
        assert!(cfg.dedup_restore);
        assert!(!cfg.mqtt.publish_checkins);
        assert_eq!(cfg.observer_buffer, 32);
    }

    #[test]
    fn test_unreadable_config_file_is_fatal() {
        let err = load(&[
            ("NOEL_CONFIG", "/nonexistent/noel.toml"),
            ("NOEL_MQTT_BROKER", "localhost"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }

    #[test]
    fn test_parse_broker_forms() {
        assert_eq!(parse_broker("localhost").unwrap(), ("localhost".into(), 1883));
        assert_eq!(parse_broker("tcp://host:1999").unwrap(), ("host".into(), 1999));
        assert_eq!(parse_broker("mqtt://broker.emqx.io").unwrap(), ("broker.emqx.io".into(), 1883));
        assert_eq!(parse_broker("[::1]:1884").unwrap(), ("::1".into(), 1884));
        assert!(parse_broker("mqtts://host:8883").is_err());
        assert!(parse_broker("host:notaport").is_err());
        assert!(parse_broker(":1883").is_err());
    }
}
