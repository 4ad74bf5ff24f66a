//! SMTP ingestion
//!
//! The inbound half of the service: a permissive SMTP listener that accepts
//! carrier gateway deliveries, extracts the verification nonce from the
//! message body, and completes challenges.

pub mod commands;
pub mod parser;
pub mod server;
pub mod session;
pub mod spf;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::SmtpSession;
pub use spf::{DnsSpfVerifier, SpfDisposition, SpfLookup};
