//! mapae: phone-number verification over carrier SMS-to-Email gateways
//!
//! A client requests a challenge over HTTP, receives a short token to put
//! in a text message, and sends that message from their phone to a
//! designated address. The carrier's MMS-to-Email gateway relays it to the
//! SMTP listener here, which extracts the token, identifies the sender's
//! phone number and carrier, and records a verified result the client can
//! poll (optionally as a signed JWT).
//!
//! # Features
//!
//! - **SMTP ingestion**: permissive, streaming parsing of broken carrier
//!   email, with a strict size cap
//! - **Exactly-once**: one-time nonce consumption under concurrent
//!   deliveries
//! - **Sender policy**: SPF over both the envelope and header senders
//! - **Tokens**: optional EdDSA (Ed25519) JWTs with a JWKS endpoint
//!
//! # Example
//!
//! ```no_run
//! use mapae::auth::Service;
//! use mapae::config::Settings;
//! use mapae::smtp::SmtpServer;
//! use mapae::storage::MemoryStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Arc::new(Settings::from_env());
//!     let store = Arc::new(MemoryStore::new());
//!     let service = Arc::new(Service::new(store, settings.clone())?);
//!
//!     let server = SmtpServer::new(settings, service);
//!     server.run(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: environment-driven configuration
//! - [`error`]: error types and handling
//! - [`auth`]: challenge lifecycle and JWT signing
//! - [`storage`]: KV backends (in-memory, Redis)
//! - [`smtp`]: SMTP listener, session handling, message parsing
//! - [`http`]: JSON API surface

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod smtp;
pub mod storage;

// Re-export commonly used types
pub use config::Settings;
pub use error::{MapaeError, Result};
