//! SMTP listener
//!
//! Accepts connections and spawns one session task per client. The listener
//! itself closes when the process-wide cancellation token fires; sessions in
//! flight observe cancellation at their next suspension point.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::Service;
use crate::config::Settings;
use crate::error::Result;
use crate::smtp::session::SmtpSession;
use crate::smtp::spf::{DnsSpfVerifier, SpfLookup};

pub struct SmtpServer {
    settings: Arc<Settings>,
    service: Arc<Service>,
    spf: Arc<dyn SpfLookup>,
}

impl SmtpServer {
    pub fn new(settings: Arc<Settings>, service: Arc<Service>) -> Self {
        Self::with_spf(settings, service, Arc::new(DnsSpfVerifier::new()))
    }

    /// Injection point for tests and alternative SPF resolvers.
    pub fn with_spf(
        settings: Arc<Settings>,
        service: Arc<Service>,
        spf: Arc<dyn SpfLookup>,
    ) -> Self {
        Self {
            settings,
            service,
            spf,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.settings.smtp_host, self.settings.smtp_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("SMTP server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SMTP server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            info!("New SMTP connection from {}", peer);
                            let peer_ip: Option<IpAddr> = Some(peer.ip());
                            let session = SmtpSession::new(
                                self.settings.clone(),
                                self.service.clone(),
                                self.spf.clone(),
                                peer_ip,
                            );
                            tokio::spawn(async move {
                                if let Err(e) = session.handle(socket).await {
                                    error!("Session error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}
