//! OIDC third-party login initiation.
//!
//! The platform starts every launch by posting `iss`, `login_hint`,
//! `target_link_uri` and `client_id` to the tool. The tool answers with a
//! redirect back to the platform's authorization endpoint carrying a fresh
//! `state` and a stored `nonce`.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::nonce::{NonceStore, random_token};
use super::platform::PlatformRegistry;
use crate::{Error, Result};

/// Login initiation parameters, as posted (or queried) by the platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    /// Platform issuer
    #[serde(default)]
    pub iss: Option<String>,
    /// Opaque user hint echoed back to the platform
    #[serde(default)]
    pub login_hint: Option<String>,
    /// Where the launch should land
    #[serde(default)]
    pub target_link_uri: Option<String>,
    /// Client id assigned to the tool
    #[serde(default)]
    pub client_id: Option<String>,
    /// Deployment the launch originates from
    #[serde(default)]
    pub lti_deployment_id: Option<String>,
    /// Opaque message hint echoed back to the platform
    #[serde(default)]
    pub lti_message_hint: Option<String>,
}

/// Result of a successful login initiation.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    /// Fully formed platform authorization URL
    pub url: Url,
    /// Opaque state value echoed back on launch
    pub state: String,
    /// Nonce persisted for the subsequent launch
    pub nonce: String,
    /// Issuer the redirect targets
    pub platform_id: String,
}

/// Builds platform authorization redirects.
pub struct OidcLoginInitiator {
    registry: Arc<PlatformRegistry>,
    nonces: Arc<dyn NonceStore>,
}

impl OidcLoginInitiator {
    /// Create an initiator over the registry and nonce store.
    #[must_use]
    pub fn new(registry: Arc<PlatformRegistry>, nonces: Arc<dyn NonceStore>) -> Self {
        Self { registry, nonces }
    }

    /// Validate the request, issue state and nonce, and build the redirect.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when a required field is missing or empty.
    /// - [`Error::UnknownPlatform`] when the issuer or client id is not registered.
    pub async fn initiate(&self, request: &LoginRequest) -> Result<LoginRedirect> {
        let iss = required(request.iss.as_deref(), "iss")?;
        let login_hint = required(request.login_hint.as_deref(), "login_hint")?;
        let target_link_uri = required(request.target_link_uri.as_deref(), "target_link_uri")?;
        let client_id = required(request.client_id.as_deref(), "client_id")?;

        let platform = self.registry.lookup(iss)?;
        if platform.client_id != client_id {
            return Err(Error::UnknownPlatform(format!(
                "{iss} has no registration for client {client_id}"
            )));
        }

        let mut url = Url::parse(&platform.auth_login_url).map_err(|e| {
            Error::Config(format!(
                "invalid auth_login_url for {iss}: {e}"
            ))
        })?;

        let state = random_token();
        let nonce = self.nonces.issue(&platform.platform_id).await;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("scope", "openid");
            params.append_pair("response_type", "id_token");
            params.append_pair("response_mode", "form_post");
            params.append_pair("prompt", "none");
            params.append_pair("client_id", client_id);
            params.append_pair("redirect_uri", target_link_uri);
            params.append_pair("login_hint", login_hint);
            params.append_pair("state", &state);
            params.append_pair("nonce", &nonce.value);
            if let Some(hint) = request.lti_message_hint.as_deref() {
                params.append_pair("lti_message_hint", hint);
            }
        }

        debug!(
            issuer = %iss,
            deployment = request.lti_deployment_id.as_deref().unwrap_or(""),
            "Built OIDC authorization redirect"
        );

        Ok(LoginRedirect {
            url,
            state,
            nonce: nonce.value,
            platform_id: platform.platform_id.clone(),
        })
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::InvalidRequest(format!("missing required parameter: {name}"))),
    }
}
