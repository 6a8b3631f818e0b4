//! Voice Controller configuration.
//!
//! Configuration is loaded from environment variables. The media engine
//! token is redacted in Debug output.

use crate::media::network::NetworkFamily;

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the signaling socket and HTTP endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8425";

/// Default grace window between a disconnect and teardown of its media.
pub const DEFAULT_DISCONNECT_GRACE_SECONDS: u64 = 60;

/// Default period of the liveness sweep.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 15;

/// Default silence after which a connection is considered dead.
pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD_SECONDS: u64 = 60;

/// Default instance ID prefix.
pub const DEFAULT_VC_ID_PREFIX: &str = "vc";

/// Voice Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Bind address for `/socket`, `/health`, `/ready` and `/metrics`.
    pub bind_address: String,

    /// Backend base URL (validation and ICE server config).
    pub backend_url: String,

    /// Interop relay WebSocket URL. `None` runs the relay in drain mode.
    pub interop_ws_url: Option<String>,

    /// Media engine worker base URL.
    pub media_engine_url: String,

    /// Optional bearer token for the media engine worker.
    pub media_engine_token: Option<SecretString>,

    /// Announced IPv4 address of the SFU.
    pub sfu_ipv4: Option<IpAddr>,

    /// Announced IPv6 address of the SFU.
    pub sfu_ipv6: Option<IpAddr>,

    /// Port the SFU listens on.
    pub sfu_port: Option<u16>,

    /// Externally reachable port when behind a port-translating tunnel.
    pub sfu_public_port: Option<u16>,

    /// Listener family used when the client's family has no listener.
    pub sfu_preferred_family: NetworkFamily,

    /// Grace window before a staged participant is finalized.
    pub disconnect_grace: Duration,

    /// Liveness sweep period.
    pub heartbeat_interval: Duration,

    /// Silence threshold that triggers a heartbeat-timeout staging.
    pub heartbeat_miss_threshold: Duration,

    /// Emit JSON logs instead of the human-readable format.
    pub log_json: bool,

    /// Unique identifier for this instance.
    pub vc_id: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("backend_url", &self.backend_url)
            .field("interop_ws_url", &self.interop_ws_url)
            .field("media_engine_url", &self.media_engine_url)
            .field(
                "media_engine_token",
                &self.media_engine_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("sfu_ipv4", &self.sfu_ipv4)
            .field("sfu_ipv6", &self.sfu_ipv6)
            .field("sfu_port", &self.sfu_port)
            .field("sfu_public_port", &self.sfu_public_port)
            .field("sfu_preferred_family", &self.sfu_preferred_family)
            .field("disconnect_grace", &self.disconnect_grace)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_miss_threshold", &self.heartbeat_miss_threshold)
            .field("log_json", &self.log_json)
            .field("vc_id", &self.vc_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let backend_url = required(vars, "VC_BACKEND_URL")?
            .trim_end_matches('/')
            .to_string();

        let media_engine_url = required(vars, "VC_MEDIA_ENGINE_URL")?
            .trim_end_matches('/')
            .to_string();

        let media_engine_token = non_empty(vars, "VC_MEDIA_ENGINE_TOKEN")
            .map(|token| SecretString::from(token.to_string()));

        let bind_address = vars
            .get("VC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let interop_ws_url = match non_empty(vars, "VC_INTEROP_WS_URL") {
            Some(url) => Some(url.to_string()),
            None => derive_interop_url(&backend_url),
        };

        let sfu_ipv4 = parse_optional::<IpAddr>(vars, "VC_SFU_IPV4")?;
        if let Some(ip) = sfu_ipv4 {
            if !ip.is_ipv4() {
                return Err(ConfigError::InvalidValue(format!(
                    "VC_SFU_IPV4 must be an IPv4 address, got {ip}"
                )));
            }
        }

        let sfu_ipv6 = parse_optional::<IpAddr>(vars, "VC_SFU_IPV6")?;
        if let Some(ip) = sfu_ipv6 {
            if !ip.is_ipv6() {
                return Err(ConfigError::InvalidValue(format!(
                    "VC_SFU_IPV6 must be an IPv6 address, got {ip}"
                )));
            }
        }

        let sfu_port = parse_optional::<u16>(vars, "VC_SFU_PORT")?;
        let sfu_public_port = parse_optional::<u16>(vars, "VC_SFU_PUBLIC_PORT")?;

        let sfu_preferred_family = match non_empty(vars, "VC_SFU_PREFERRED_FAMILY") {
            Some(raw) => raw.parse::<NetworkFamily>().map_err(|()| {
                ConfigError::InvalidValue(format!(
                    "VC_SFU_PREFERRED_FAMILY must be ipv4 or ipv6, got {raw}"
                ))
            })?,
            None => NetworkFamily::Ipv4,
        };

        let disconnect_grace = Duration::from_secs(
            parse_optional(vars, "VC_DISCONNECT_GRACE_SECONDS")?
                .unwrap_or(DEFAULT_DISCONNECT_GRACE_SECONDS),
        );

        let heartbeat_interval = Duration::from_secs(
            parse_optional(vars, "VC_HEARTBEAT_INTERVAL_SECONDS")?
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
        );

        let heartbeat_miss_threshold = Duration::from_secs(
            parse_optional(vars, "VC_HEARTBEAT_MISS_THRESHOLD_SECONDS")?
                .unwrap_or(DEFAULT_HEARTBEAT_MISS_THRESHOLD_SECONDS),
        );

        if heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "VC_HEARTBEAT_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        if heartbeat_miss_threshold <= heartbeat_interval {
            return Err(ConfigError::InvalidValue(format!(
                "VC_HEARTBEAT_MISS_THRESHOLD_SECONDS ({}) must exceed VC_HEARTBEAT_INTERVAL_SECONDS ({})",
                heartbeat_miss_threshold.as_secs(),
                heartbeat_interval.as_secs()
            )));
        }

        let log_json = non_empty(vars, "VC_LOG_JSON")
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");

        // Generate instance ID
        let vc_id = vars.get("VC_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_VC_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            backend_url,
            interop_ws_url,
            media_engine_url,
            media_engine_token,
            sfu_ipv4,
            sfu_ipv6,
            sfu_port,
            sfu_public_port,
            sfu_preferred_family,
            disconnect_grace,
            heartbeat_interval,
            heartbeat_miss_threshold,
            log_json,
            vc_id,
        })
    }
}

fn required<'a>(vars: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    non_empty(vars, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key)
        .map(String::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_optional<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match non_empty(vars, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{key} has invalid value {raw}"))),
        None => Ok(None),
    }
}

/// `http://api/x` becomes `ws://api/x/interop`, `https` becomes `wss`.
fn derive_interop_url(backend_url: &str) -> Option<String> {
    let ws_base = if let Some(rest) = backend_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = backend_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return None;
    };
    Some(format!("{ws_base}/interop"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "VC_BACKEND_URL".to_string(),
                "https://api.example.com/voice/".to_string(),
            ),
            (
                "VC_MEDIA_ENGINE_URL".to_string(),
                "http://localhost:4443".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.backend_url, "https://api.example.com/voice");
        assert_eq!(
            config.interop_ws_url.as_deref(),
            Some("wss://api.example.com/voice/interop")
        );
        assert_eq!(config.media_engine_url, "http://localhost:4443");
        assert!(config.media_engine_token.is_none());
        assert_eq!(config.sfu_ipv4, None);
        assert_eq!(config.sfu_ipv6, None);
        assert_eq!(config.sfu_port, None);
        assert_eq!(config.sfu_public_port, None);
        assert_eq!(config.sfu_preferred_family, NetworkFamily::Ipv4);
        assert_eq!(
            config.disconnect_grace,
            Duration::from_secs(DEFAULT_DISCONNECT_GRACE_SECONDS)
        );
        assert_eq!(
            config.heartbeat_interval,
            Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS)
        );
        assert_eq!(
            config.heartbeat_miss_threshold,
            Duration::from_secs(DEFAULT_HEARTBEAT_MISS_THRESHOLD_SECONDS)
        );
        assert!(!config.log_json);
        assert!(config.vc_id.starts_with("vc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("VC_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert(
            "VC_INTEROP_WS_URL".to_string(),
            "ws://relay:7000/events".to_string(),
        );
        vars.insert("VC_MEDIA_ENGINE_TOKEN".to_string(), "s3cret".to_string());
        vars.insert("VC_SFU_IPV4".to_string(), "203.0.113.7".to_string());
        vars.insert("VC_SFU_IPV6".to_string(), "2001:db8::7".to_string());
        vars.insert("VC_SFU_PORT".to_string(), "40000".to_string());
        vars.insert("VC_SFU_PUBLIC_PORT".to_string(), "443".to_string());
        vars.insert("VC_SFU_PREFERRED_FAMILY".to_string(), "IPv6".to_string());
        vars.insert("VC_DISCONNECT_GRACE_SECONDS".to_string(), "30".to_string());
        vars.insert("VC_HEARTBEAT_INTERVAL_SECONDS".to_string(), "5".to_string());
        vars.insert(
            "VC_HEARTBEAT_MISS_THRESHOLD_SECONDS".to_string(),
            "20".to_string(),
        );
        vars.insert("VC_LOG_JSON".to_string(), "true".to_string());
        vars.insert("VC_ID".to_string(), "vc-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.interop_ws_url.as_deref(), Some("ws://relay:7000/events"));
        assert_eq!(
            config.media_engine_token.as_ref().unwrap().expose_secret(),
            "s3cret"
        );
        assert_eq!(config.sfu_ipv4, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(config.sfu_ipv6, Some("2001:db8::7".parse().unwrap()));
        assert_eq!(config.sfu_port, Some(40000));
        assert_eq!(config.sfu_public_port, Some(443));
        assert_eq!(config.sfu_preferred_family, NetworkFamily::Ipv6);
        assert_eq!(config.disconnect_grace, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_miss_threshold, Duration::from_secs(20));
        assert!(config.log_json);
        assert_eq!(config.vc_id, "vc-custom-001");
    }

    #[test]
    fn test_missing_backend_url() {
        let mut vars = base_vars();
        vars.remove("VC_BACKEND_URL");

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "VC_BACKEND_URL")
        );
    }

    #[test]
    fn test_missing_media_engine_url() {
        let mut vars = base_vars();
        vars.insert("VC_MEDIA_ENGINE_URL".to_string(), "   ".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "VC_MEDIA_ENGINE_URL")
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut vars = base_vars();
        vars.insert("VC_SFU_PORT".to_string(), "70000".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_wrong_family_address_rejected() {
        let mut vars = base_vars();
        vars.insert("VC_SFU_IPV4".to_string(), "2001:db8::1".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_invalid_preferred_family_rejected() {
        let mut vars = base_vars();
        vars.insert("VC_SFU_PREFERRED_FAMILY".to_string(), "ipx".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_threshold_must_exceed_interval() {
        let mut vars = base_vars();
        vars.insert("VC_HEARTBEAT_INTERVAL_SECONDS".to_string(), "30".to_string());
        vars.insert(
            "VC_HEARTBEAT_MISS_THRESHOLD_SECONDS".to_string(),
            "30".to_string(),
        );

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_interop_url_derivation() {
        assert_eq!(
            derive_interop_url("http://localhost:3000/voice").as_deref(),
            Some("ws://localhost:3000/voice/interop")
        );
        assert_eq!(
            derive_interop_url("https://api.example.com").as_deref(),
            Some("wss://api.example.com/interop")
        );
        assert_eq!(derive_interop_url("ftp://nope"), None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut vars = base_vars();
        vars.insert(
            "VC_MEDIA_ENGINE_TOKEN".to_string(),
            "super-secret-token".to_string(),
        );
        let config = Config::from_vars(&vars).unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }
}
