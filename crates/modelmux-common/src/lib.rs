use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Top-level application configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables capture of response bodies into the request log.
    #[serde(default)]
    pub request_log: bool,
    /// Keys accepted from downstream clients of this proxy.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Upstream providers and their credential seeds.
    #[serde(default)]
    pub providers: Vec<ProviderSeed>,
    /// Provider names eligible for `name://model` dynamic routes.
    #[serde(default)]
    pub openai_compat_providers: Vec<String>,
    /// Extra model-routing rules layered over the built-in table.
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub sticky_index: StickyIndexConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                message: "must be non-zero".to_string(),
            });
        }
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::MissingField("providers[].name"));
            }
            if provider.base_url.trim().is_empty() {
                return Err(ConfigError::MissingField("providers[].base-url"));
            }
            for auth in &provider.auths {
                if auth.id.trim().is_empty() {
                    return Err(ConfigError::MissingField("providers[].auths[].id"));
                }
            }
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_log: false,
            api_keys: Vec::new(),
            providers: Vec::new(),
            openai_compat_providers: Vec::new(),
            routes: Vec::new(),
            sticky_index: StickyIndexConfig::default(),
        }
    }
}

/// One upstream provider with the credentials this process may use for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProviderSeed {
    /// Lowercase provider tag, e.g. `codex`, `gemini`, `claude`.
    pub name: String,
    pub base_url: String,
    /// Optional path suffix used for upstream token counting.
    #[serde(default)]
    pub count_tokens_path: Option<String>,
    #[serde(default)]
    pub auths: Vec<AuthSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AuthSeed {
    /// Stable identifier, unique across the whole config.
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Maps model names to candidate providers, in preference order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RouteRule {
    /// Matched against the start of the normalized model name.
    pub prefix: String,
    pub providers: Vec<String>,
}

/// Persistence options for the sticky-routing message index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StickyIndexConfig {
    #[serde(default)]
    pub redis_enabled: bool,
    #[serde(default)]
    pub redis_addr: Option<String>,
    #[serde(default)]
    pub redis_password: Option<String>,
    #[serde(default)]
    pub redis_db: i64,
    /// Key prefix, default `msgidx`.
    #[serde(default)]
    pub redis_prefix: Option<String>,
    /// Binding expiry in seconds; `None` or `<= 0` uses the built-in default.
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: AppConfig = serde_yaml::from_str("port: 9000\n").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert!(!cfg.request_log);
        assert!(cfg.providers.is_empty());
        assert!(!cfg.sticky_index.redis_enabled);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<AppConfig>("bogus-key: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn provider_seed_round_trip() {
        let yaml = r#"
providers:
  - name: codex
    base-url: https://example.test/api
    auths:
      - id: codex-a
        api-key: sk-test
openai-compat-providers: ["groq"]
routes:
  - prefix: "llama-"
    providers: ["groq"]
sticky-index:
  redis-enabled: true
  redis-addr: 127.0.0.1:6379
  ttl-seconds: 600
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.providers[0].auths[0].id, "codex-a");
        assert_eq!(cfg.openai_compat_providers, vec!["groq"]);
        assert_eq!(cfg.routes[0].providers, vec!["groq"]);
        assert_eq!(cfg.sticky_index.ttl_seconds, Some(600));
    }

    #[test]
    fn validate_rejects_blank_auth_id() {
        let mut cfg = AppConfig::default();
        cfg.providers.push(ProviderSeed {
            name: "codex".to_string(),
            base_url: "https://example.test".to_string(),
            count_tokens_path: None,
            auths: vec![AuthSeed {
                id: "  ".to_string(),
                label: None,
                api_key: None,
                disabled: false,
            }],
        });
        assert!(cfg.validate().is_err());
    }
}
