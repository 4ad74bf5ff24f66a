use thiserror::Error;

use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum MapaeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Auth handle failed the 32-hex-character format check.
    #[error("invalid_auth_id")]
    InvalidAuthId,

    /// No signing key is configured; JWT and JWKS operations are unavailable.
    #[error("jwks_unavailable")]
    JwksUnavailable,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MapaeError>;
