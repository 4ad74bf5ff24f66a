//! SMTP command parsing
//!
//! Parses the RFC 5321 command set the verification listener needs. The
//! listener never relays, so the surface is intentionally small; anything
//! unrecognized is reported back as `Unknown` for a 502.

use crate::error::{MapaeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    /// AUTH is accepted syntactically but never honored.
    Auth(String),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MapaeError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MapaeError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MapaeError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => {
                let from = Self::parse_path(args, "FROM:")
                    .ok_or_else(|| MapaeError::SmtpProtocol("Invalid MAIL FROM syntax".to_string()))?;
                Ok(SmtpCommand::MailFrom(from))
            }
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")
                    .ok_or_else(|| MapaeError::SmtpProtocol("Invalid RCPT TO syntax".to_string()))?;
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "AUTH" => {
                if args.is_empty() {
                    return Err(MapaeError::SmtpProtocol("AUTH requires mechanism".to_string()));
                }
                Ok(SmtpCommand::Auth(args.to_string()))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Extracts the address from `FROM:<a@b>` / `TO:<a@b>`, tolerating a
    /// missing angle-bracket pair. MAIL FROM parameters after the path
    /// (e.g. `SIZE=...`) are dropped.
    fn parse_path(args: &str, keyword: &str) -> Option<String> {
        if !args.to_uppercase().starts_with(keyword) {
            return None;
        }
        let rest = args[keyword.len()..].trim();
        if let Some(end) = rest.find('>') {
            if let Some(start) = rest.find('<') {
                if start < end {
                    return Some(rest[start + 1..end].to_string());
                }
            }
        }
        Some(rest.split_whitespace().next().unwrap_or("").to_string())
    }
}
