//! SPF verification
//!
//! Carrier gateways put the true originator in the header From while the
//! envelope sender is a relay, so the session checks both and accepts the
//! logical OR. The DNS lookup lives behind a trait so sessions are testable
//! without the network.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mail_auth::{Resolver, SpfResult};
use tracing::{debug, warn};

/// Outcome of a single SPF evaluation, RFC 7208 vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfDisposition {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfDisposition {
    pub fn is_pass(self) -> bool {
        matches!(self, SpfDisposition::Pass)
    }
}

#[async_trait]
pub trait SpfLookup: Send + Sync {
    /// Evaluates whether `client_ip` is authorized to send for the domain
    /// of `sender`.
    async fn check(&self, client_ip: IpAddr, sender: &str) -> SpfDisposition;
}

/// DNS-backed SPF verifier.
pub struct DnsSpfVerifier {
    resolver: Arc<Resolver>,
}

impl DnsSpfVerifier {
    pub fn new() -> Self {
        let resolver = Resolver::new_system_conf().unwrap_or_else(|_| {
            warn!("Failed to load system DNS config, using default resolver");
            Resolver::new_cloudflare_tls().expect("Failed to create DNS resolver")
        });
        Self {
            resolver: Arc::new(resolver),
        }
    }
}

impl Default for DnsSpfVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpfLookup for DnsSpfVerifier {
    async fn check(&self, client_ip: IpAddr, sender: &str) -> SpfDisposition {
        let domain = sender.split('@').nth(1).unwrap_or(sender);

        let output = self
            .resolver
            .verify_spf_sender(client_ip, domain, domain, sender)
            .await;
        let result = output.result();
        debug!(ip = %client_ip, sender, ?result, "SPF evaluated");

        match result {
            SpfResult::Pass => SpfDisposition::Pass,
            SpfResult::Fail => SpfDisposition::Fail,
            SpfResult::SoftFail => SpfDisposition::SoftFail,
            SpfResult::Neutral => SpfDisposition::Neutral,
            SpfResult::TempError => SpfDisposition::TempError,
            SpfResult::PermError => SpfDisposition::PermError,
            SpfResult::None => SpfDisposition::None,
        }
    }
}
