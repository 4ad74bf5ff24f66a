//! Verification service
//!
//! Owns the challenge lifecycle. Two index entries back every challenge:
//! `auth:<auth_id>` holds the status payload and `nonce:<nonce>` points back
//! at the auth_id. The nonce entry is consumed at most once; consuming it is
//! the linearization point that makes a verification exactly-once.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::signer::JwtSigner;
use crate::config::Settings;
use crate::error::{MapaeError, Result};
use crate::storage::Store;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_WAITING: &str = "waiting";
pub const STATUS_VERIFIED: &str = "verified";
pub const STATUS_EXPIRED: &str = "expired";

#[derive(Debug, Serialize)]
pub struct InitAuthResponse {
    pub auth_id: String,
    pub sms_body: String,
    pub link: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CheckAuthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl CheckAuthResponse {
    fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Serialize)]
struct PendingPayload<'a> {
    status: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct VerifiedPayload<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    carrier: Option<&'a str>,
    timestamp: String,
}

pub struct Service {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
    signer: Option<JwtSigner>,
}

impl Service {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Result<Self> {
        let signer = JwtSigner::from_settings(&settings)?;
        Ok(Self {
            store,
            settings,
            signer,
        })
    }

    /// Allocates a challenge: fresh (auth_id, nonce), both index entries
    /// written with the challenge TTL.
    pub async fn init_auth(&self) -> Result<InitAuthResponse> {
        let nonce = random_hex(32)?;
        let auth_id = random_hex(16)?;

        let payload = PendingPayload {
            status: STATUS_PENDING,
            timestamp: rfc3339_now(),
        };
        let payload_json = serde_json::to_string(&payload)?;

        self.store
            .set_ex(
                &auth_key(&auth_id),
                &payload_json,
                self.settings.auth_ttl_seconds,
            )
            .await?;
        self.store
            .set_ex(&nonce_key(&nonce), &auth_id, self.settings.auth_ttl_seconds)
            .await?;

        let sms_body = format!("[MAPAE:{nonce}]");
        let link = format!("sms:{}?body={}", self.settings.sms_inbound_address, sms_body);
        debug!(auth_id, "issued verification challenge");

        Ok(InitAuthResponse {
            auth_id,
            sms_body,
            link,
            ttl_seconds: self.settings.auth_ttl_seconds,
        })
    }

    /// Projects the stored record onto a client-facing status. A missing
    /// key reads as expired; a corrupt payload degrades to waiting so a
    /// stale record never blocks a retry.
    pub async fn check_auth(&self, auth_id: &str) -> Result<CheckAuthResponse> {
        if !is_valid_auth_id(auth_id) {
            return Err(MapaeError::InvalidAuthId);
        }
        let Some(value) = self.store.get(&auth_key(auth_id)).await? else {
            return Ok(CheckAuthResponse::with_status(STATUS_EXPIRED));
        };
        let Ok(decoded) = serde_json::from_str::<CheckAuthResponse>(&value) else {
            return Ok(CheckAuthResponse::with_status(STATUS_WAITING));
        };
        if decoded.status == STATUS_VERIFIED {
            return Ok(decoded);
        }
        Ok(CheckAuthResponse::with_status(STATUS_WAITING))
    }

    /// Like `check_auth` but mints a signed token for verified results.
    /// Without a configured signer this is always `jwks_unavailable`.
    pub async fn check_signed(&self, auth_id: &str) -> Result<CheckAuthResponse> {
        if !is_valid_auth_id(auth_id) {
            return Err(MapaeError::InvalidAuthId);
        }
        let Some(value) = self.store.get(&auth_key(auth_id)).await? else {
            return Ok(CheckAuthResponse::with_status(STATUS_EXPIRED));
        };
        let Ok(mut decoded) = serde_json::from_str::<CheckAuthResponse>(&value) else {
            return Ok(CheckAuthResponse::with_status(STATUS_WAITING));
        };
        if decoded.status != STATUS_VERIFIED {
            return Ok(CheckAuthResponse::with_status(STATUS_WAITING));
        }
        let Some(signer) = &self.signer else {
            return Err(MapaeError::JwksUnavailable);
        };
        let Some(phone) = decoded.phone.clone().filter(|p| !p.is_empty()) else {
            return Ok(CheckAuthResponse::with_status(STATUS_WAITING));
        };
        let carrier = decoded.carrier.clone().unwrap_or_default();
        let token = signer.sign(auth_id, &phone, &carrier, auth_id)?;
        decoded.token = Some(token);
        Ok(decoded)
    }

    /// Atomic take of the nonce index entry. `None` means unknown, expired,
    /// or already consumed.
    pub async fn consume_auth_id_by_nonce(&self, nonce: &str) -> Result<Option<String>> {
        Ok(self.store.take(&nonce_key(nonce)).await?)
    }

    /// Overwrites the auth entry with a verified record and the shorter
    /// retention TTL. Duplicate deliveries refresh the record.
    pub async fn store_verified(
        &self,
        auth_id: &str,
        phone: Option<&str>,
        carrier: Option<&str>,
    ) -> Result<()> {
        let payload = VerifiedPayload {
            status: STATUS_VERIFIED,
            phone,
            carrier,
            timestamp: rfc3339_now(),
        };
        let payload_json = serde_json::to_string(&payload)?;
        self.store
            .set_ex(
                &auth_key(auth_id),
                &payload_json,
                self.settings.verified_ttl_seconds,
            )
            .await?;
        Ok(())
    }

    pub fn jwks(&self) -> Result<Vec<u8>> {
        match &self.signer {
            Some(signer) => signer.jwks(),
            None => Err(MapaeError::JwksUnavailable),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }

    #[cfg(test)]
    pub(crate) fn signer(&self) -> Option<&JwtSigner> {
        self.signer.as_ref()
    }
}

pub fn is_valid_auth_id(auth_id: &str) -> bool {
    auth_id.len() == 32 && auth_id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn auth_key(auth_id: &str) -> String {
    format!("auth:{auth_id}")
}

fn nonce_key(nonce: &str) -> String {
    format!("nonce:{nonce}")
}

fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn random_hex(bytes_len: usize) -> Result<String> {
    if bytes_len == 0 {
        return Err(MapaeError::Parse("invalid random length".to_string()));
    }
    let mut buf = vec![0u8; bytes_len];
    OsRng.fill_bytes(&mut buf);
    Ok(hex::encode(buf))
}
