//! Tool signing key: RS256 signing and JWKS publication.
//!
//! The tool owns exactly one RSA keypair for the life of the process. It is
//! either loaded from a PKCS#8 PEM file or generated at startup; a failure in
//! either path is fatal. The public half is published at `GET /lti/jwks` so
//! platforms can verify our Deep Linking responses and client assertions.

use std::path::Path;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rcgen::{KeyPair, PKCS_RSA_SHA256, PublicKeyData};
use serde::{Deserialize, Serialize};
use tracing::info;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::config::KeysConfig;
use crate::{Error, Result};

/// A single public JWK, field names exactly as RFC 7517 spells them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `RSA`
    pub kty: String,
    /// Public key use, always `sig`
    #[serde(rename = "use")]
    pub key_use: String,
    /// Key id
    pub kid: String,
    /// Algorithm, always `RS256`
    pub alg: String,
    /// Modulus, base64url without padding
    pub n: String,
    /// Public exponent, base64url without padding
    pub e: String,
}

/// JWKS document served at `GET /lti/jwks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwksDocument {
    /// Published keys
    pub keys: Vec<Jwk>,
}

/// Owns the tool keypair. Read-only after construction; share behind `Arc`.
pub struct KeyManager {
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager").field("kid", &self.kid).finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Build from configuration: load the PEM if a path is set, otherwise generate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key cannot be read, parsed, or generated.
    pub fn from_config(config: &KeysConfig) -> Result<Self> {
        match config.private_key_path.as_deref() {
            Some(path) => {
                let pem = std::fs::read_to_string(Path::new(path)).map_err(|e| {
                    Error::Config(format!("cannot read private key {path}: {e}"))
                })?;
                info!(kid = %config.kid, path = %path, "Loaded tool signing key");
                Self::from_pem(&config.kid, &pem)
            }
            None => {
                info!(kid = %config.kid, "Generating ephemeral 2048-bit RSA tool key");
                Self::generate(&config.kid)
            }
        }
    }

    /// Generate a fresh 2048-bit RSA keypair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if key generation fails.
    pub fn generate(kid: &str) -> Result<Self> {
        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
            .map_err(|e| Error::Config(format!("RSA key generation failed: {e}")))?;
        Self::from_key_pair(kid, &key_pair)
    }

    /// Load a PKCS#8 PEM encoded RSA private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the PEM is not an RSA private key.
    pub fn from_pem(kid: &str, pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(pem)
            .map_err(|e| Error::Config(format!("invalid private key PEM: {e}")))?;
        Self::from_key_pair(kid, &key_pair)
    }

    fn from_key_pair(kid: &str, key_pair: &KeyPair) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key_pair.serialize_pem().as_bytes())
            .map_err(|e| Error::Config(format!("not an RSA signing key: {e}")))?;

        let (n, e) = rsa_components(&key_pair.subject_public_key_info())?;
        let decoding_key = DecodingKey::from_rsa_raw_components(&n, &e);

        let jwk = Jwk {
            kty: "RSA".to_string(),
            key_use: "sig".to_string(),
            kid: kid.to_string(),
            alg: "RS256".to_string(),
            n: URL_SAFE_NO_PAD.encode(&n),
            e: URL_SAFE_NO_PAD.encode(&e),
        };

        Ok(Self {
            kid: kid.to_string(),
            encoding_key,
            decoding_key,
            jwk,
        })
    }

    /// Key id stamped on every JWT this tool signs.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Sign `claims` as an RS256 JWT carrying this key's `kid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the claims cannot be serialized or signed.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("JWT signing failed: {e}")))
    }

    /// Single-entry JWKS with the public half of the tool key.
    #[must_use]
    pub fn public_jwks(&self) -> JwksDocument {
        JwksDocument {
            keys: vec![self.jwk.clone()],
        }
    }

    /// Verification key matching [`sign`](Self::sign).
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

/// Extract the big-endian modulus and exponent from an RSA SubjectPublicKeyInfo.
fn rsa_components(spki_der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| Error::Config(format!("invalid public key DER: {e}")))?;
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok((
            strip_leading_zeros(rsa.modulus).to_vec(),
            strip_leading_zeros(rsa.exponent).to_vec(),
        )),
        Ok(_) => Err(Error::Config("tool key is not an RSA key".to_string())),
        Err(e) => Err(Error::Config(format!("cannot parse public key: {e}"))),
    }
}

/// DER integers carry a sign byte; JWK values must not.
fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}
