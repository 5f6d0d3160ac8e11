//! Nonce store: single-use, short-lived launch nonces.
//!
//! A nonce is issued during OIDC login initiation and must come back exactly
//! once inside the platform's `id_token`. Verification and deletion happen in
//! one `DashMap::remove_if` call, so two concurrent launches carrying the same
//! nonce cannot both succeed.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An issued, not yet consumed nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nonce {
    /// Opaque random value
    pub value: String,
    /// Issuer the nonce was issued for
    pub platform_id: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Expiry (`issued_at + ttl`)
    pub expires_at: DateTime<Utc>,
}

impl Nonce {
    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Storage backend for nonces.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request handlers and the sweeper task.
#[async_trait::async_trait]
pub trait NonceStore: Send + Sync + 'static {
    /// Create and persist a nonce for `platform_id`.
    async fn issue(&self, platform_id: &str) -> Nonce;

    /// Atomically check that `value` exists for `platform_id` and is unexpired,
    /// then delete it. Every failure mode returns `false`.
    async fn verify_and_consume(&self, value: &str, platform_id: &str) -> bool;

    /// Remove expired, unconsumed nonces. Returns the number removed.
    async fn reap_expired(&self) -> usize;
}

/// In-memory nonce store backed by a `DashMap`.
pub struct InMemoryNonceStore {
    nonces: DashMap<String, Nonce>,
    ttl: Duration,
}

impl InMemoryNonceStore {
    /// Create an empty store whose nonces live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            nonces: DashMap::new(),
            ttl,
        }
    }

    /// Number of outstanding nonces (expired ones included until reaped).
    #[must_use]
    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    /// `true` when no nonce is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

/// 256 bits of randomness, base64url encoded.
#[must_use]
pub fn random_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[async_trait::async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn issue(&self, platform_id: &str) -> Nonce {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5));
        let nonce = Nonce {
            value: random_token(),
            platform_id: platform_id.to_string(),
            issued_at,
            expires_at: issued_at + ttl,
        };
        self.nonces.insert(nonce.value.clone(), nonce.clone());
        nonce
    }

    async fn verify_and_consume(&self, value: &str, platform_id: &str) -> bool {
        // A nonce presented for the wrong platform is left in place so it
        // cannot be burned by a request naming another platform.
        let Some((_, nonce)) = self
            .nonces
            .remove_if(value, |_, n| n.platform_id == platform_id)
        else {
            return false;
        };
        !nonce.is_expired()
    }

    async fn reap_expired(&self) -> usize {
        let before = self.nonces.len();
        self.nonces.retain(|_, n| !n.is_expired());
        let reaped = before.saturating_sub(self.nonces.len());
        if reaped > 0 {
            debug!(count = reaped, "Reaped expired nonces");
        }
        reaped
    }
}
