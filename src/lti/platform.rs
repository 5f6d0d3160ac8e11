//! Platform registry: immutable per-issuer configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::PlatformConfig;
use crate::{Error, Result};

/// Default AGS line-item container path, relative to the issuer.
const DEFAULT_LINE_ITEMS_PATH: &str = "/api/lti/courses/{context_id}/line_items";

/// A registered LTI platform. Never mutated after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Issuer URL; the lookup key
    pub platform_id: String,
    /// Client id assigned to this tool
    pub client_id: String,
    /// Deployment id of this tool on the platform
    pub deployment_id: String,
    /// Platform JWKS endpoint
    pub jwks_url: String,
    /// OAuth2 token endpoint
    pub token_url: String,
    /// OIDC authorization endpoint
    pub auth_login_url: String,
    /// Registered tool launch URL
    pub target_link_uri: String,
    /// Line-item container template (`{context_id}` placeholder)
    pub line_items_url: Option<String>,
}

impl Platform {
    /// Line-item container URL for a course context.
    #[must_use]
    pub fn line_items_url_for(&self, context_id: &str) -> String {
        let template = self.line_items_url.clone().unwrap_or_else(|| {
            format!(
                "{}{DEFAULT_LINE_ITEMS_PATH}",
                self.platform_id.trim_end_matches('/')
            )
        });
        template.replace("{context_id}", context_id)
    }
}

impl From<PlatformConfig> for Platform {
    fn from(config: PlatformConfig) -> Self {
        Self {
            platform_id: config.issuer,
            client_id: config.client_id,
            deployment_id: config.deployment_id,
            jwks_url: config.jwks_url,
            token_url: config.token_url,
            auth_login_url: config.auth_login_url,
            target_link_uri: config.target_link_uri,
            line_items_url: config.line_items_url,
        }
    }
}

/// Read-only issuer → platform map, built once and passed explicitly.
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    platforms: HashMap<String, Platform>,
}

impl PlatformRegistry {
    /// Build from a list of platforms.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a duplicate issuer or an empty required field.
    pub fn new(platforms: impl IntoIterator<Item = Platform>) -> Result<Self> {
        let mut map = HashMap::new();
        for platform in platforms {
            for (field, value) in [
                ("issuer", &platform.platform_id),
                ("client_id", &platform.client_id),
                ("jwks_url", &platform.jwks_url),
                ("token_url", &platform.token_url),
                ("auth_login_url", &platform.auth_login_url),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "platform {} has an empty {field}",
                        platform.platform_id
                    )));
                }
            }
            let issuer = platform.platform_id.clone();
            if map.insert(issuer.clone(), platform).is_some() {
                return Err(Error::Config(format!("duplicate platform issuer: {issuer}")));
            }
        }
        Ok(Self { platforms: map })
    }

    /// Build from the `platforms:` configuration section.
    ///
    /// # Errors
    ///
    /// See [`PlatformRegistry::new`].
    pub fn from_config(configs: &[PlatformConfig]) -> Result<Self> {
        Self::new(configs.iter().cloned().map(Platform::from))
    }

    /// Look up a platform by issuer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPlatform`] when the issuer is not registered.
    pub fn lookup(&self, issuer: &str) -> Result<&Platform> {
        self.platforms
            .get(issuer)
            .ok_or_else(|| Error::UnknownPlatform(issuer.to_string()))
    }

    /// Number of registered platforms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    /// `true` when no platform is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}
