//! EdDSA token signer
//!
//! Optional capability: with no private key configured the service reports
//! `jwks_unavailable` instead of falling back to unsigned tokens. The key is
//! a PEM-encoded PKCS#8 Ed25519 private key, usually delivered through an
//! environment variable, so the loader tolerates the quoting and newline
//! escaping those pipelines produce.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::config::Settings;
use crate::error::{MapaeError, Result};

const DEFAULT_TOKEN_TTL_SECONDS: i64 = 3600;

pub struct JwtSigner {
    encoding_key: EncodingKey,
    public_key: [u8; 32],
    issuer: String,
    ttl_seconds: i64,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    auth_id: &'a str,
    iat: i64,
    exp: i64,
    phone_number: &'a str,
    carrier: &'a str,
    jti: &'a str,
}

#[derive(Serialize)]
struct JwkKey<'a> {
    kty: &'a str,
    crv: &'a str,
    x: String,
    #[serde(rename = "use")]
    key_use: &'a str,
    alg: &'a str,
}

#[derive(Serialize)]
struct JwksResponse<'a> {
    keys: Vec<JwkKey<'a>>,
}

impl JwtSigner {
    /// Returns `None` when no private key is configured; JWT-dependent
    /// operations then surface `jwks_unavailable`.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        if settings.jwt_private_key_pem.trim().is_empty() {
            return Ok(None);
        }
        let pem = normalize_pem(&settings.jwt_private_key_pem);
        let signing_key = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| MapaeError::InvalidKey(format!("parse ed25519 private key: {e}")))?;
        let encoding_key = EncodingKey::from_ed_pem(pem.as_bytes())?;

        let ttl_seconds = if settings.jwt_ttl_seconds <= 0 {
            DEFAULT_TOKEN_TTL_SECONDS
        } else {
            settings.jwt_ttl_seconds
        };

        Ok(Some(Self {
            encoding_key,
            public_key: signing_key.verifying_key().to_bytes(),
            issuer: settings.jwt_issuer.clone(),
            ttl_seconds,
        }))
    }

    pub fn sign(&self, auth_id: &str, phone_number: &str, carrier: &str, jti: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.issuer,
            sub: phone_number,
            auth_id,
            iat: now,
            exp: now + self.ttl_seconds,
            phone_number,
            carrier,
            jti,
        };
        Ok(encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding_key)?)
    }

    pub fn jwks(&self) -> Result<Vec<u8>> {
        let key = JwkKey {
            kty: "OKP",
            crv: "Ed25519",
            x: general_purpose::URL_SAFE_NO_PAD.encode(self.public_key),
            key_use: "sig",
            alg: "EdDSA",
        };
        Ok(serde_json::to_vec(&JwksResponse { keys: vec![key] })?)
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.public_key
    }
}

/// Undoes what environment-variable loaders do to PEM blocks: surrounding
/// quotes left as literal characters, and `\n` / `\r\n` escape sequences
/// (single- and double-escaped) instead of real newlines.
fn normalize_pem(raw: &str) -> String {
    let mut value = raw.trim();
    loop {
        let stripped = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
        match stripped {
            Some(inner) => value = inner.trim(),
            None => break,
        }
    }

    value
        .replace("\\\\r\\\\n", "\n")
        .replace("\\\\n", "\n")
        .replace("\\\\r", "\n")
        .replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\\r", "\n")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}
