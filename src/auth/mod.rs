//! Challenge lifecycle and token issuance

pub mod service;
pub mod signer;

pub use service::{CheckAuthResponse, InitAuthResponse, Service};
pub use signer::JwtSigner;
