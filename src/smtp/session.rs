//! SMTP session handling
//!
//! One session per inbound connection. The command loop enforces timeouts,
//! line-length and error-count limits; DATA is collected with dot-unstuffing
//! up to the configured size cap and then run through the verification
//! pipeline: parse, SPF over both senders, one-time nonce consume, verified
//! record write. Outcomes map onto SMTP reply codes.

use std::io::Cursor;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::Service;
use crate::config::Settings;
use crate::error::{MapaeError, Result};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::parser;
use crate::smtp::spf::{SpfDisposition, SpfLookup};

/// Greeting banner, kept from the service's origins.
const BANNER: &str = "JOSEON DYNASTY MAPAE - Amhaeng-eosa Chuldo-ya!";

/// Timeout for reading a command line
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for reading DATA content
const DATA_TIMEOUT: Duration = Duration::from_secs(600);

/// Bound on SPF plus store work per delivery, so a dropped connection
/// cannot keep downstream calls running.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a single SPF evaluation
const SPF_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum command line length (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Per-read cap during DATA so a line without a terminator cannot grow a
/// buffer unboundedly.
const DATA_CHUNK_BYTES: u64 = 8192;

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

#[derive(Debug, PartialEq)]
struct SmtpReply {
    code: u16,
    text: &'static str,
}

impl SmtpReply {
    fn new(code: u16, text: &'static str) -> Self {
        Self { code, text }
    }

    fn line(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

struct DataOutcome {
    reply: SmtpReply,
    auth_id: Option<String>,
    stored: bool,
}

impl DataOutcome {
    fn rejected(reply: SmtpReply) -> Self {
        Self {
            reply,
            auth_id: None,
            stored: false,
        }
    }
}

pub struct SmtpSession {
    state: SmtpState,
    mail_from: Option<String>,
    rcpt_tos: Vec<String>,
    data: Vec<u8>,
    over_limit: bool,
    peer_ip: Option<IpAddr>,
    conn_start: Instant,
    error_count: usize,
    settings: Arc<Settings>,
    service: Arc<Service>,
    spf: Arc<dyn SpfLookup>,
}

impl SmtpSession {
    pub fn new(
        settings: Arc<Settings>,
        service: Arc<Service>,
        spf: Arc<dyn SpfLookup>,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            mail_from: None,
            rcpt_tos: Vec::new(),
            data: Vec::new(),
            over_limit: false,
            peer_ip,
            conn_start: Instant::now(),
            error_count: 0,
            settings,
            service,
            spf,
        }
    }

    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream);

        reader
            .write_all(format!("220 {BANNER} ESMTP Service Ready\r\n").as_bytes())
            .await?;

        let mut line = String::new();
        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("Too many errors, disconnecting");
                reader
                    .write_all(b"421 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(());
            }

            line.clear();
            let n = match timeout(COMMAND_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("IO error reading line: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Command timeout, disconnecting");
                    reader
                        .write_all(b"421 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(());
                }
            };

            if n == 0 {
                debug!("Client disconnected");
                return Ok(());
            }

            if line.len() > MAX_LINE_LENGTH {
                error!("Line too long: {} bytes", line.len());
                reader.write_all(b"500 Line too long\r\n").await?;
                self.error_count += 1;
                continue;
            }

            let line_trimmed = line.trim_end();
            debug!("Received: {}", line_trimmed);

            match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => {
                    let response = self.handle_command(cmd);
                    reader.write_all(response.as_bytes()).await?;

                    if response.starts_with("221") {
                        return Ok(());
                    }

                    if self.state == SmtpState::Data {
                        match self.receive_data(&mut reader).await {
                            Ok(()) => {
                                let reply = self.finish_data().await;
                                reader.write_all(reply.line().as_bytes()).await?;
                            }
                            Err(e) => {
                                error!("Error receiving data: {}", e);
                                reader.write_all(b"451 Error receiving message\r\n").await?;
                                self.error_count += 1;
                            }
                        }
                        self.reset_transaction();
                    }
                }
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    reader
                        .write_all(b"500 Syntax error, command unrecognized\r\n")
                        .await?;
                    self.error_count += 1;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match (&self.state, cmd) {
            (SmtpState::Fresh, SmtpCommand::Helo(domain)) => {
                info!("HELO from {}", domain);
                self.state = SmtpState::Greeted;
                format!("250 {BANNER} Hello {domain}\r\n")
            }
            (SmtpState::Fresh, SmtpCommand::Ehlo(domain)) => {
                info!("EHLO from {}", domain);
                self.state = SmtpState::Greeted;
                format!(
                    "250-{BANNER} Hello {domain}\r\n250-SIZE {}\r\n250 HELP\r\n",
                    self.settings.data_size_limit_bytes
                )
            }
            (
                SmtpState::Greeted | SmtpState::MailFrom | SmtpState::RcptTo,
                SmtpCommand::MailFrom(from),
            ) => {
                info!("MAIL FROM: {}", from);
                self.mail_from = Some(from.trim().to_string());
                self.rcpt_tos.clear();
                self.data.clear();
                self.over_limit = false;
                self.state = SmtpState::MailFrom;
                "250 OK\r\n".to_string()
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                let inbound = self.settings.sms_inbound_address.trim();
                if !inbound.is_empty() && !to.trim().eq_ignore_ascii_case(inbound) {
                    info!("RCPT TO rejected: {}", to);
                    return "550 Not relaying to that address\r\n".to_string();
                }
                if !self.rcpt_tos.is_empty() {
                    return "452 Too many recipients (max 1)\r\n".to_string();
                }
                info!("RCPT TO: {}", to);
                self.rcpt_tos.push(to);
                self.state = SmtpState::RcptTo;
                "250 OK\r\n".to_string()
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                self.state = SmtpState::Data;
                "354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string()
            }
            (_, SmtpCommand::Rset) => {
                self.reset_transaction();
                self.mail_from = None;
                "250 OK\r\n".to_string()
            }
            (_, SmtpCommand::Noop) => "250 OK\r\n".to_string(),
            (_, SmtpCommand::Quit) => format!("221 {BANNER} closing connection\r\n"),
            (_, SmtpCommand::Auth(_)) => "502 Authentication not required\r\n".to_string(),
            (_, SmtpCommand::Unknown(cmd)) => {
                debug!("Unknown command: {}", cmd);
                self.error_count += 1;
                "502 Command not implemented\r\n".to_string()
            }
            _ => {
                self.error_count += 1;
                "503 Bad sequence of commands\r\n".to_string()
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.state = SmtpState::Greeted;
        self.rcpt_tos.clear();
        self.data.clear();
        self.over_limit = false;
    }

    /// Collects the DATA body until the terminating dot. Bytes past the
    /// size cap are consumed but not buffered; the over-limit flag turns
    /// the whole transaction into a 552.
    async fn receive_data<S>(&mut self, reader: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limit = self.settings.data_size_limit_bytes;
        let mut line: Vec<u8> = Vec::new();
        let mut at_line_start = true;

        loop {
            line.clear();
            let n = match timeout(DATA_TIMEOUT, read_chunk_line(reader, &mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(MapaeError::SmtpProtocol("Timeout during DATA".to_string()));
                }
            };
            if n == 0 {
                return Err(MapaeError::SmtpProtocol(
                    "Connection closed during DATA".to_string(),
                ));
            }

            let complete = line.ends_with(b"\n");
            if at_line_start && complete && (line == b".\r\n" || line == b".\n") {
                break;
            }

            // Transparency: strip the dot the client prepended.
            let payload: &[u8] = if at_line_start && line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line
            };

            if limit > 0 && !self.over_limit && self.data.len() + payload.len() > limit {
                self.over_limit = true;
            }
            if !self.over_limit {
                self.data.extend_from_slice(payload);
            }
            at_line_start = complete;
        }

        Ok(())
    }

    /// Runs the verification pipeline over the collected body and logs one
    /// structured completion line per delivery.
    async fn finish_data(&mut self) -> SmtpReply {
        if self.over_limit {
            warn!(
                "Message too large (limit={} bytes)",
                self.settings.data_size_limit_bytes
            );
            return SmtpReply::new(552, "Message size exceeds limit");
        }

        let outcome = match timeout(OPERATION_TIMEOUT, self.verify_message()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("DATA processing timed out");
                DataOutcome::rejected(SmtpReply::new(451, "Temporary server error"))
            }
        };
        self.log_completion(&outcome);
        outcome.reply
    }

    async fn verify_message(&self) -> DataOutcome {
        let raw = self.data.as_slice();
        let mail_from = self.mail_from.clone().unwrap_or_default();

        // Streaming scan first; the permissive pass fills whatever it
        // could not produce.
        let mut header_from = String::new();
        let mut nonce: Option<String> = None;
        match parser::scan_message(Cursor::new(raw), 0) {
            Ok(outcome) => {
                header_from = outcome.header_from;
                nonce = outcome.nonce;
            }
            Err(err) => debug!("stream scan fell back to permissive parser: {}", err),
        }
        let (body_text, headers) = parser::parse_body(raw);
        if header_from.is_empty() {
            header_from = headers.get("from").cloned().unwrap_or_default();
        }
        if header_from.is_empty() {
            header_from = parser::extract_header_from_raw(raw);
        }
        let (_, body_bytes) = parser::split_header_body(raw);

        let (env_phone, env_carrier) = parser::extract_phone_and_carrier(&mail_from);
        let (hdr_phone, hdr_carrier) = parser::extract_phone_and_carrier(&header_from);

        let mut env_pass = false;
        let mut hdr_pass = false;
        if let Some(peer_ip) = self.peer_ip {
            let mut env_result = None;
            let mut hdr_result = None;
            if let Some(sender) = sanitize_sender(&mail_from) {
                let result = self.spf_check(peer_ip, &sender).await;
                env_pass = result.is_pass();
                env_result = Some(result);
            }
            if let Some(sender) = sanitize_sender(&header_from) {
                let result = self.spf_check(peer_ip, &sender).await;
                hdr_pass = result.is_pass();
                hdr_result = Some(result);
            }
            if !(env_pass || hdr_pass) {
                let temperror = env_result == Some(SpfDisposition::TempError)
                    || hdr_result == Some(SpfDisposition::TempError);
                if temperror {
                    info!(
                        ip = %peer_ip, mail_from, header_from,
                        "SPF temperror"
                    );
                    return DataOutcome::rejected(SmtpReply::new(451, "SPF temperror"));
                }
                info!(ip = %peer_ip, mail_from, header_from, "SPF fail");
                return DataOutcome::rejected(SmtpReply::new(550, "SPF fail"));
            }
        }

        // The chosen phone/carrier pair is the one whose SPF passed;
        // envelope wins over header.
        let peer_known = self.peer_ip.is_some();
        let (phone, carrier) = if env_carrier.is_some() && (!peer_known || env_pass) {
            (env_phone, env_carrier)
        } else if hdr_carrier.is_some() && (!peer_known || hdr_pass) {
            (hdr_phone, hdr_carrier)
        } else {
            (None, None)
        };
        let Some(carrier) = carrier else {
            info!("Carrier domain not recognized");
            return DataOutcome::rejected(SmtpReply::new(550, "Invalid carrier domain"));
        };

        if self.settings.dump_inbound {
            info!(mail_from, header_from, raw_len = raw.len(), body = %body_text, "inbound dump");
        }

        let nonce = nonce.or_else(|| parser::find_nonce_with_fallback(&body_text, body_bytes));
        let Some(nonce) = nonce else {
            info!("Nonce not found in message body");
            return DataOutcome::rejected(SmtpReply::new(550, "Invalid nonce"));
        };

        let auth_id = match self.service.consume_auth_id_by_nonce(&nonce).await {
            Ok(Some(auth_id)) => auth_id,
            Ok(None) => {
                info!("Nonce not found or expired");
                return DataOutcome::rejected(SmtpReply::new(550, "Invalid nonce"));
            }
            Err(err) => {
                error!("Store error while looking up nonce: {}", err);
                return DataOutcome::rejected(SmtpReply::new(451, "Temporary server error"));
            }
        };

        match self
            .service
            .store_verified(&auth_id, phone.as_deref(), Some(&carrier))
            .await
        {
            Ok(()) => {
                info!("Stored verification for auth_id {}", auth_id);
                DataOutcome {
                    reply: SmtpReply::new(250, "OK"),
                    auth_id: Some(auth_id),
                    stored: true,
                }
            }
            Err(err) => {
                error!("Failed to store verification: {}", err);
                DataOutcome {
                    reply: SmtpReply::new(451, "Temporary server error"),
                    auth_id: Some(auth_id),
                    stored: false,
                }
            }
        }
    }

    async fn spf_check(&self, peer_ip: IpAddr, sender: &str) -> SpfDisposition {
        match timeout(SPF_TIMEOUT, self.spf.check(peer_ip, sender)).await {
            Ok(result) => result,
            Err(_) => SpfDisposition::TempError,
        }
    }

    fn log_completion(&self, outcome: &DataOutcome) {
        let peer = self
            .peer_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        let result = if outcome.reply.code == 250 {
            "pass"
        } else {
            "fail"
        };
        let mail_from = self.mail_from.as_deref().unwrap_or_default();
        let shown = if self.settings.debug {
            mail_from.to_string()
        } else {
            mask_email_local_part(mail_from)
        };
        info!(
            peer = %peer,
            rcpt = %self.rcpt_tos.join(","),
            result,
            auth_id = outcome.auth_id.as_deref().unwrap_or("-"),
            stored = outcome.stored,
            mail_from = %shown,
            duration_ms = self.conn_start.elapsed().as_millis() as u64,
            "smtp delivery"
        );
    }
}

async fn read_chunk_line<S>(reader: &mut BufReader<S>, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(DATA_CHUNK_BYTES);
    limited.read_until(b'\n', buf).await
}

/// Reduces a sender expression to a bare address: angle-addr contents when
/// present, empty for the null reverse-path.
fn sanitize_sender(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "<>" {
        return None;
    }
    Some(parse_angle_addr(trimmed).unwrap_or_else(|| trimmed.to_string()))
}

fn parse_angle_addr(value: &str) -> Option<String> {
    let start = value.find('<')?;
    let end = value[start..].find('>')? + start;
    let addr = value[start + 1..end].trim();
    if addr.is_empty() {
        return None;
    }
    Some(addr.to_string())
}

/// `user@example.com` → `***@example.com`; inputs without a domain pass
/// through untouched.
fn mask_email_local_part(value: &str) -> String {
    let addr = parse_angle_addr(value).unwrap_or_else(|| value.to_string());
    match addr.rfind('@') {
        None => addr,
        Some(at) => {
            let domain = &addr[at + 1..];
            if domain.is_empty() {
                "***".to_string()
            } else {
                format!("***@{domain}")
            }
        }
    }
}
