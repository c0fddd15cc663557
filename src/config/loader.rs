//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::{StorageConfig, TunnelConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { var: &'static str, value: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { var, value } => {
                write!(f, "Invalid value '{}' for environment variable {}", value, var)
            }
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub const ENV_REQUESTS_FOLDER: &str = "TUNNEL_REQUESTS_FOLDER";
pub const ENV_RESPONSES_FOLDER: &str = "TUNNEL_RESPONSES_FOLDER";
pub const ENV_POLL_INTERVAL_MS: &str = "TUNNEL_POLL_INTERVAL_MS";
pub const ENV_RESPONSE_TIMEOUT_MS: &str = "TUNNEL_RESPONSE_TIMEOUT_MS";
pub const ENV_CONNECTION_TIMEOUT_MS: &str = "TUNNEL_CONNECTION_TIMEOUT_MS";
pub const ENV_SESSION_IDLE_TIMEOUT_MS: &str = "TUNNEL_SESSION_IDLE_TIMEOUT_MS";
pub const ENV_STORE_ROOT: &str = "TUNNEL_STORE_ROOT";
pub const ENV_STORE_URL: &str = "TUNNEL_STORE_URL";
pub const ENV_STORE_TOKEN: &str = "TUNNEL_STORE_TOKEN";
pub const ENV_BIND_ADDRESS: &str = "TUNNEL_BIND_ADDRESS";
pub const ENV_LOG_LEVEL: &str = "TUNNEL_LOG_LEVEL";

/// Load configuration: optional TOML file, then process environment, then validation.
pub fn load_config(path: Option<&Path>) -> Result<TunnelConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => TunnelConfig::default(),
    };

    apply_env_overrides(&mut config, std::env::vars())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply recognized `TUNNEL_*` variables on top of `config`.
///
/// Takes the variables explicitly so callers (and tests) decide where they come from.
pub fn apply_env_overrides<I>(config: &mut TunnelConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        match key.as_str() {
            ENV_REQUESTS_FOLDER => config.protocol.requests_folder = value,
            ENV_RESPONSES_FOLDER => config.protocol.responses_folder = value,
            ENV_POLL_INTERVAL_MS => {
                config.protocol.poll_interval_ms = parse_ms(ENV_POLL_INTERVAL_MS, value)?
            }
            ENV_RESPONSE_TIMEOUT_MS => {
                config.protocol.response_timeout_ms = parse_ms(ENV_RESPONSE_TIMEOUT_MS, value)?
            }
            ENV_CONNECTION_TIMEOUT_MS => {
                config.protocol.connection_timeout_ms = parse_ms(ENV_CONNECTION_TIMEOUT_MS, value)?
            }
            ENV_SESSION_IDLE_TIMEOUT_MS => {
                config.sessions.idle_timeout_ms = parse_ms(ENV_SESSION_IDLE_TIMEOUT_MS, value)?
            }
            ENV_STORE_ROOT => config.storage = StorageConfig::Filesystem { root: value },
            ENV_STORE_URL => {
                let token = match &config.storage {
                    StorageConfig::Http { token, .. } => token.clone(),
                    _ => None,
                };
                config.storage = StorageConfig::Http {
                    base_url: value,
                    token,
                    request_timeout_secs: 30,
                };
            }
            ENV_STORE_TOKEN => {
                if let StorageConfig::Http { token, .. } = &mut config.storage {
                    *token = Some(value);
                }
            }
            ENV_BIND_ADDRESS => config.caller.bind_address = value,
            ENV_LOG_LEVEL => config.observability.log_level = value,
            _ => {}
        }
    }
    Ok(())
}

fn parse_ms(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn env_overrides_protocol_settings() {
        let mut config = TunnelConfig::default();
        apply_env_overrides(
            &mut config,
            vars(&[
                (ENV_REQUESTS_FOLDER, "in"),
                (ENV_RESPONSES_FOLDER, "out"),
                (ENV_POLL_INTERVAL_MS, "250"),
                (ENV_RESPONSE_TIMEOUT_MS, "9000"),
                (ENV_SESSION_IDLE_TIMEOUT_MS, "30000"),
                ("UNRELATED", "ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(config.protocol.requests_folder, "in");
        assert_eq!(config.protocol.responses_folder, "out");
        assert_eq!(config.protocol.poll_interval_ms, 250);
        assert_eq!(config.protocol.response_timeout_ms, 9000);
        assert_eq!(config.sessions.idle_timeout_ms, 30000);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let mut config = TunnelConfig::default();
        let err = apply_env_overrides(&mut config, vars(&[(ENV_POLL_INTERVAL_MS, "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_POLL_INTERVAL_MS));
    }

    #[test]
    fn store_url_then_token() {
        let mut config = TunnelConfig::default();
        apply_env_overrides(
            &mut config,
            vars(&[
                (ENV_STORE_URL, "https://blobs.example.net"),
                (ENV_STORE_TOKEN, "secret"),
            ]),
        )
        .unwrap();

        assert_eq!(
            config.storage,
            StorageConfig::Http {
                base_url: "https://blobs.example.net".to_string(),
                token: Some("secret".to_string()),
                request_timeout_secs: 30,
            }
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.toml");
        std::fs::write(
            &path,
            r#"
            [protocol]
            poll_interval_ms = 200

            [sessions]
            session_ports = [443, 8443]
            "#,
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let config: TunnelConfig = toml::from_str(&content).unwrap();
        assert_eq!(config.protocol.poll_interval_ms, 200);
        assert_eq!(config.sessions.session_ports, vec![443, 8443]);
        assert!(validate_config(&config).is_ok());
    }
}
