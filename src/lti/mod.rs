//! LTI 1.3 tool side: login, launch, sessions and Deep Linking.
//!
//! # Flow
//!
//! ```text
//! Platform POST /lti/oidc/login
//!   -> OidcLoginInitiator: issue state + nonce, 302 to platform auth
//! Platform POST /lti/launch (id_token, state)
//!   -> LaunchValidator: JWKS, RS256, aud/iss/exp, nonce, claims
//!   -> LaunchSessions::store (both message types)
//!   -> DeepLinkingRequest: DeepLinkingCoordinator (settings + catalog)
//! Instructor POST /lti/deep-linking/response (launch_id, selected_items[])
//!   -> LaunchSessions::get, DeepLinkingCoordinator::respond
//!   -> signed LtiDeepLinkingResponse, auto-post
//! ```

pub mod claims;
pub mod deep_linking;
pub mod handler;
pub mod keys;
pub mod launch;
pub mod login;
pub mod nonce;
pub mod platform;
pub mod session;

use std::sync::Arc;

use crate::Result;
use crate::config::Config;

pub use claims::{LaunchContext, MessageType};
pub use deep_linking::{
    ContentCatalog, ContentItem, DeepLinkingCoordinator, DeepLinkingResponse, DeepLinkingSettings,
    LineItemTemplate, StaticCatalog,
};
pub use keys::{JwksDocument, KeyManager};
pub use launch::{JwksCache, LaunchValidator, ValidatedLaunch};
pub use login::{LoginRedirect, LoginRequest, OidcLoginInitiator};
pub use nonce::{InMemoryNonceStore, NonceStore};
pub use platform::{Platform, PlatformRegistry};
pub use session::{InMemoryLaunchStore, LaunchSessionStore, LaunchSessions, StoredLaunch};

/// Every LTI component, wired from configuration and shared by the handlers.
pub struct LtiService {
    /// Tool signing key
    pub keys: Arc<KeyManager>,
    /// Registered platforms
    pub registry: Arc<PlatformRegistry>,
    /// Login initiation
    pub login: OidcLoginInitiator,
    /// `id_token` verification
    pub validator: LaunchValidator,
    /// Stored launches and expiry sweep
    pub sessions: Arc<LaunchSessions>,
    /// Content selection
    pub deep_linking: DeepLinkingCoordinator,
}

impl LtiService {
    /// Build the service, loading or generating the tool key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when the key or platform list is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let keys = Arc::new(KeyManager::from_config(&config.keys)?);
        Self::with_keys(config, keys)
    }

    /// Build the service around an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when the platform list is invalid.
    pub fn with_keys(config: &Config, keys: Arc<KeyManager>) -> Result<Self> {
        let registry = Arc::new(PlatformRegistry::from_config(&config.platforms)?);
        let nonces: Arc<dyn NonceStore> = Arc::new(InMemoryNonceStore::new(config.launch.nonce_ttl));
        let jwks = Arc::new(JwksCache::new(&config.launch)?);

        let sessions = Arc::new(LaunchSessions::new(
            Arc::new(InMemoryLaunchStore::new()),
            Arc::clone(&nonces),
            config.launch.session_ttl,
        ));
        let deep_linking = DeepLinkingCoordinator::new(
            Arc::clone(&keys),
            Arc::clone(&registry),
            Arc::new(StaticCatalog::new(config.deep_linking.catalog.clone())),
            config.deep_linking.response_ttl,
        );

        Ok(Self {
            login: OidcLoginInitiator::new(Arc::clone(&registry), Arc::clone(&nonces)),
            validator: LaunchValidator::new(Arc::clone(&registry), nonces, jwks, &config.launch),
            sessions,
            deep_linking,
            keys,
            registry,
        })
    }
}
