//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lti::ContentItem;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Tool signing key configuration
    pub keys: KeysConfig,
    /// Registered platforms (one entry per issuer)
    pub platforms: Vec<PlatformConfig>,
    /// Launch handshake configuration
    pub launch: LaunchConfig,
    /// Assignment and Grade Services configuration
    pub ags: AgsConfig,
    /// Deep Linking configuration
    pub deep_linking: DeepLinkingConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // LTI_BRIDGE_SERVER__PORT=8080 style overrides
        figment = figment.merge(Env::prefixed("LTI_BRIDGE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secrets-bearing fields
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("env pattern: {e}")))?;

        if let Some(path) = self.keys.private_key_path.as_mut() {
            *path = Self::expand_string(&re, path);
        }
        for platform in &mut self.platforms {
            platform.client_id = Self::expand_string(&re, &platform.client_id);
            platform.deployment_id = Self::expand_string(&re, &platform.deployment_id);
        }
        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout for inbound HTTP requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Tool signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Key id published in the JWKS and stamped on every outgoing JWT
    pub kid: String,
    /// PKCS#8 PEM private key. A fresh key is generated when unset.
    pub private_key_path: Option<String>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            kid: "lti-bridge-1".to_string(),
            private_key_path: None,
        }
    }
}

/// One registered LTI platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Issuer URL (the `iss` claim); registry key
    pub issuer: String,
    /// Client id assigned to this tool by the platform
    pub client_id: String,
    /// Deployment id of this tool on the platform
    pub deployment_id: String,
    /// Platform JWKS endpoint
    pub jwks_url: String,
    /// Platform OAuth2 token endpoint
    pub token_url: String,
    /// Platform OIDC authorization endpoint
    pub auth_login_url: String,
    /// Tool launch URL registered with the platform
    pub target_link_uri: String,
    /// Line-item container URL template; `{context_id}` is substituted
    #[serde(default)]
    pub line_items_url: Option<String>,
}

/// Launch handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Lifetime of an issued nonce
    #[serde(with = "humantime_serde")]
    pub nonce_ttl: Duration,
    /// Lifetime of a stored launch
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Interval between expired nonce/launch sweeps
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Upper bound on total launch validation time (JWKS fetch included)
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// How long a fetched platform JWKS is cached
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Minimum spacing of forced JWKS refreshes (unknown `kid`) per issuer
    #[serde(with = "humantime_serde")]
    pub jwks_min_refresh_interval: Duration,
    /// Permit plain-HTTP platform endpoints (local development only)
    pub allow_insecure_http: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            nonce_ttl: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            handshake_timeout: Duration::from_secs(10),
            jwks_cache_ttl: Duration::from_secs(3600),
            jwks_min_refresh_interval: Duration::from_secs(60),
            allow_insecure_http: false,
        }
    }
}

/// Assignment and Grade Services configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgsConfig {
    /// Per-call timeout for token exchange and AGS requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum in-flight score submissions during a bulk sync
    pub max_concurrency: usize,
    /// Lifetime of the client assertion JWT
    #[serde(with = "humantime_serde")]
    pub assertion_ttl: Duration,
}

impl Default for AgsConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_concurrency: 4,
            assertion_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Deep Linking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepLinkingConfig {
    /// Lifetime of a signed Deep Linking response
    #[serde(with = "humantime_serde")]
    pub response_ttl: Duration,
    /// Static content catalog offered to instructors
    pub catalog: Vec<ContentItem>,
}

impl Default for DeepLinkingConfig {
    fn default() -> Self {
        Self {
            response_ttl: Duration::from_secs(5 * 60),
            catalog: Vec::new(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "24h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "24h" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
