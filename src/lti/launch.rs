//! Launch validation: platform `id_token` verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`;
//!    decode the payload (no verification) to extract `iss`.
//! 2. Resolve the platform by `iss`.
//! 3. Fetch the platform JWKS (cached; refreshed on unknown `kid`, at most
//!    once per `jwks_min_refresh_interval` per issuer).
//! 4. Verify the RS256 signature and `aud`, `iss`, `exp`.
//! 5. Consume the `nonce` exactly once.
//! 6. Map the LTI claims into a [`LaunchContext`].
//!
//! Nothing read in step 1 is trusted beyond choosing which key to verify with.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::{DashMap, mapref::entry::Entry};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    errors::ErrorKind,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::claims::LaunchContext;
use super::nonce::NonceStore;
use super::platform::{Platform, PlatformRegistry};
use crate::config::LaunchConfig;
use crate::error::{TokenValidationError, UpstreamError};
use crate::{Error, Result};

/// A successfully validated launch.
#[derive(Debug, Clone)]
pub struct ValidatedLaunch {
    /// Issuer of the launch
    pub platform_id: String,
    /// Typed launch context
    pub context: LaunchContext,
    /// Full verified claim set, kept for audit
    pub raw_claims: Map<String, Value>,
}

/// Only the issuer is read before verification.
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: String,
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Platform JWKS cache, one entry per issuer.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    forced: DashMap<String, Instant>,
    http: reqwest::Client,
    ttl: Duration,
    min_refresh_interval: Duration,
}

impl JwksCache {
    /// Create a cache from the launch configuration. HTTPS is enforced
    /// unless `allow_insecure_http` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &LaunchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(!config.allow_insecure_http)
            .timeout(config.handshake_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build JWKS client: {e}")))?;
        Ok(Self {
            inner: DashMap::new(),
            forced: DashMap::new(),
            http,
            ttl: config.jwks_cache_ttl,
            min_refresh_interval: config.jwks_min_refresh_interval,
        })
    }

    /// Return the cached JWKS for `issuer`, or fetch from `jwks_url` if stale.
    ///
    /// A forced refresh bypasses the TTL, but only once per
    /// `min_refresh_interval` per issuer; further forced refreshes inside the
    /// window are answered from the cache.
    pub async fn get_or_fetch(
        &self,
        issuer: &str,
        jwks_url: &str,
        force_refresh: bool,
    ) -> std::result::Result<JwkSet, UpstreamError> {
        let force = force_refresh && self.claim_forced_refresh(issuer);
        if !force {
            if let Some(cached) = self.inner.get(issuer) {
                if force_refresh || cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(issuer = %issuer, "Fetching platform JWKS from {jwks_url}");
        let response = self
            .http
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| UpstreamError::transport("JWKS fetch", e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                operation: "JWKS fetch",
                status,
                body,
            });
        }
        let jwks: JwkSet = response.json().await.map_err(|e| UpstreamError::Decode {
            operation: "JWKS fetch",
            reason: e.to_string(),
        })?;

        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }

    /// Record a forced refresh for `issuer` unless one happened inside the window.
    fn claim_forced_refresh(&self, issuer: &str) -> bool {
        let now = Instant::now();
        match self.forced.entry(issuer.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) < self.min_refresh_interval {
                    debug!(issuer = %issuer, "Forced JWKS refresh suppressed, refreshed recently");
                    return false;
                }
                slot.insert(now);
                true
            }
        }
    }
}

/// Verifies platform `id_token`s and produces [`LaunchContext`]s.
pub struct LaunchValidator {
    registry: Arc<PlatformRegistry>,
    nonces: Arc<dyn NonceStore>,
    jwks: Arc<JwksCache>,
    handshake_timeout: Duration,
}

impl LaunchValidator {
    /// Create a validator.
    #[must_use]
    pub fn new(
        registry: Arc<PlatformRegistry>,
        nonces: Arc<dyn NonceStore>,
        jwks: Arc<JwksCache>,
        config: &LaunchConfig,
    ) -> Self {
        Self {
            registry,
            nonces,
            jwks,
            handshake_timeout: config.handshake_timeout,
        }
    }

    /// Validate an `id_token` posted back by the platform.
    ///
    /// The whole handshake is bounded by the configured timeout; exceeding it
    /// is a failure.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when `id_token` or `state` is empty.
    /// - [`Error::UnknownPlatform`] when the issuer is not registered.
    /// - [`Error::Upstream`] when the platform JWKS cannot be fetched.
    /// - [`Error::TokenValidation`] for every signature, claim, or nonce failure.
    pub async fn validate(&self, id_token: &str, state: &str) -> Result<ValidatedLaunch> {
        if id_token.trim().is_empty() {
            return Err(Error::InvalidRequest("missing required parameter: id_token".to_string()));
        }
        if state.trim().is_empty() {
            return Err(Error::InvalidRequest("missing required parameter: state".to_string()));
        }

        match tokio::time::timeout(self.handshake_timeout, self.verify(id_token)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout {
                operation: "launch validation",
                seconds: self.handshake_timeout.as_secs(),
            }
            .into()),
        }
    }

    async fn verify(&self, id_token: &str) -> Result<ValidatedLaunch> {
        let header = jsonwebtoken::decode_header(id_token).map_err(TokenValidationError::from)?;
        if header.alg != Algorithm::RS256 {
            return Err(TokenValidationError::UnsupportedAlgorithm(format!("{:?}", header.alg)).into());
        }
        let unverified = extract_unverified_claims(id_token)?;

        let platform = self.registry.lookup(&unverified.iss)?;

        let decoding_key = self.find_decoding_key(platform, header.kid.as_deref()).await?;

        let validation = build_validation(platform);
        let token_data =
            jsonwebtoken::decode::<Map<String, Value>>(id_token, &decoding_key, &validation)
                .map_err(|e| map_jwt_error(e, platform))?;
        let claims = token_data.claims;

        check_authorized_party(&claims, &platform.client_id)?;

        let nonce = claims
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or(TokenValidationError::MissingClaim("nonce"))?;
        if !self
            .nonces
            .verify_and_consume(nonce, &platform.platform_id)
            .await
        {
            return Err(TokenValidationError::ReplayedNonce.into());
        }

        let context = LaunchContext::from_claims(&claims)?;
        if !platform.deployment_id.is_empty() && context.deployment_id != platform.deployment_id {
            return Err(TokenValidationError::InvalidClaim {
                claim: "deployment_id",
                reason: format!("deployment {} is not registered", context.deployment_id),
            }
            .into());
        }

        Ok(ValidatedLaunch {
            platform_id: platform.platform_id.clone(),
            context,
            raw_claims: claims,
        })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if not found.
    async fn find_decoding_key(&self, platform: &Platform, kid: Option<&str>) -> Result<DecodingKey> {
        let issuer = &platform.platform_id;
        let jwks = self
            .jwks
            .get_or_fetch(issuer, &platform.jwks_url, false)
            .await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = ?kid, issuer = %issuer, "Key not found in cached JWKS, refreshing");
        let jwks = self
            .jwks
            .get_or_fetch(issuer, &platform.jwks_url, true)
            .await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| {
            TokenValidationError::NoUsableKey(kid.unwrap_or("<none>").to_string()).into()
        })
    }
}

/// Extract the issuer from a JWT without signature verification.
fn extract_unverified_claims(token: &str) -> std::result::Result<UnverifiedClaims, TokenValidationError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenValidationError::Malformed("expected three segments".to_string()));
    };

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenValidationError::Malformed(format!("payload encoding: {e}")))?;
    serde_json::from_slice::<UnverifiedClaims>(&payload)
        .map_err(|e| TokenValidationError::Malformed(format!("payload: {e}")))
}

/// Pick an RSA key: exact `kid` match, or the first RSA key when the token has no `kid`.
fn find_key_in_jwks(jwks: &JwkSet, kid: Option<&str>) -> Option<DecodingKey> {
    jwks.keys
        .iter()
        .filter(|jwk| match kid {
            Some(kid) => jwk.common.key_id.as_deref() == Some(kid),
            None => true,
        })
        .find_map(|jwk| match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        })
}

/// RS256 only, audience = client id, issuer = platform id, 60s leeway.
fn build_validation(platform: &Platform) -> Validation {
    let mut v = Validation::new(Algorithm::RS256);
    v.leeway = 60;
    v.set_audience(&[platform.client_id.as_str()]);
    v.set_issuer(&[platform.platform_id.as_str()]);
    v.set_required_spec_claims(&["exp", "iss", "aud"]);
    v
}

fn map_jwt_error(err: jsonwebtoken::errors::Error, platform: &Platform) -> Error {
    let mapped = match err.kind() {
        ErrorKind::InvalidAudience => TokenValidationError::AudienceMismatch {
            expected: platform.client_id.clone(),
        },
        ErrorKind::InvalidIssuer => TokenValidationError::IssuerMismatch {
            expected: platform.platform_id.clone(),
        },
        _ => TokenValidationError::from(err),
    };
    warn!(issuer = %platform.platform_id, error = %mapped, "id_token rejected");
    mapped.into()
}

/// With several audiences, OIDC requires `azp` to name this client.
fn check_authorized_party(
    claims: &Map<String, Value>,
    client_id: &str,
) -> std::result::Result<(), TokenValidationError> {
    let multi_audience = claims
        .get("aud")
        .and_then(Value::as_array)
        .is_some_and(|aud| aud.len() > 1);
    let azp = claims.get("azp").and_then(Value::as_str);

    match (multi_audience, azp) {
        (_, Some(azp)) if azp != client_id => Err(TokenValidationError::InvalidClaim {
            claim: "azp",
            reason: format!("authorized party {azp} is not this client"),
        }),
        (true, None) => Err(TokenValidationError::MissingClaim("azp")),
        _ => Ok(()),
    }
}
