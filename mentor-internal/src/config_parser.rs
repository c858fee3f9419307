use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::plan::Plan;

/// Gateway configuration, deserialized from a TOML file. Every section has
/// defaults so an empty file yields a working development gateway (in-memory
/// store, echo provider).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Plaintext session token to user id. Hashed at startup.
    #[serde(default)]
    pub sessions: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis connection URL. `MENTOR_REDIS_URL` takes precedence when set.
    pub url: Option<String>,
    /// Users seeded at startup. Only honored by the in-memory backend.
    #[serde(default)]
    pub users: Vec<SeedUserConfig>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedUserConfig {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    #[serde(default)]
    pub plan: Plan,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the OpenAI-compatible API, e.g. `https://api.openai.com/v1/`.
    pub base_url: Option<Url>,
    pub model: Option<String>,
    /// Environment variable holding the provider API key.
    pub api_key_env: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Echo,
    OpenaiCompatible,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        Self::load_from_toml(&contents)
    }

    pub fn load_from_toml(contents: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file as valid TOML: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.store.backend == StoreBackend::Redis
            && self.store.url.is_none()
            && std::env::var("MENTOR_REDIS_URL").is_err()
        {
            return Err(Error::new(ErrorDetails::Config {
                message: "Store backend is `redis` but neither `store.url` nor the \
                          MENTOR_REDIS_URL environment variable is set"
                    .to_string(),
            }));
        }

        if self.provider.kind == ProviderKind::OpenaiCompatible {
            if self.provider.base_url.is_none() {
                return Err(Error::new(ErrorDetails::Config {
                    message: "Provider kind is `openai_compatible` but `provider.base_url` \
                              is not set"
                        .to_string(),
                }));
            }
            if self.provider.model.is_none() {
                return Err(Error::new(ErrorDetails::Config {
                    message: "Provider kind is `openai_compatible` but `provider.model` \
                              is not set"
                        .to_string(),
                }));
            }
        }

        Ok(())
    }

    /// Redis URL with the environment variable taking precedence over the
    /// config file.
    pub fn redis_url(&self) -> Option<String> {
        std::env::var("MENTOR_REDIS_URL")
            .ok()
            .or_else(|| self.store.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::load_from_toml("").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.provider.kind, ProviderKind::Echo);
        assert!(config.sessions.is_empty());
        assert!(!config.gateway.debug);
    }

    #[test]
    fn test_full_config() {
        let config = Config::load_from_toml(
            r#"
            [gateway]
            bind_address = "0.0.0.0:3000"
            debug = true

            [store]
            backend = "redis"
            url = "redis://localhost:6379"

            [provider]
            kind = "openai_compatible"
            base_url = "https://api.openai.com/v1/"
            model = "gpt-4o-mini"
            api_key_env = "OPENAI_API_KEY"

            [sessions]
            tok-abc = "user-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.provider.kind, ProviderKind::OpenaiCompatible);
        assert_eq!(config.sessions.get("tok-abc").map(String::as_str), Some("user-1"));
    }

    #[test]
    fn test_seed_users() {
        let config = Config::load_from_toml(
            r#"
            [[store.users]]
            id = "user-1"
            email = "ada@example.com"
            plan = "pro"

            [[store.users]]
            id = "user-2"
            email = "alan@example.com"
            name = "Alan"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.users.len(), 2);
        assert_eq!(config.store.users[0].plan, Plan::Pro);
        assert_eq!(config.store.users[1].plan, Plan::Free);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let err = Config::load_from_toml(
            r#"
            [store]
            backend = "redis"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("MENTOR_REDIS_URL"));
    }

    #[test]
    fn test_openai_compatible_requires_base_url_and_model() {
        let err = Config::load_from_toml(
            r#"
            [provider]
            kind = "openai_compatible"
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result = Config::load_from_toml(
            r#"
            [gateway]
            bind_adress = "0.0.0.0:3000"
            "#,
        );
        assert!(result.is_err());
    }
}
