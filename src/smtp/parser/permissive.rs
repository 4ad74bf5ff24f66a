//! Permissive message parser
//!
//! Carrier gateways emit non-conformant messages: missing Message-ID, lone
//! LF line endings, inconsistent folding. This parser accepts all of that.
//! It is the fallback for the streaming scanner and the source of the
//! phone/carrier extraction used on both envelope and header senders.

use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;

pub const NONCE_HEX_LENGTH: usize = 64;

static NONCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\[MAPAE:([0-9a-f]{{{NONCE_HEX_LENGTH}}})\]"))
        .expect("nonce pattern")
});

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9-]{9,13})@([A-Za-z0-9.-]+)").expect("phone pattern"));

/// Gateway domains of the Korean carriers. Closed-world: a new domain is a
/// code change.
fn carrier_for_domain(domain: &str) -> Option<&'static str> {
    match domain {
        "vmms.nate.com" => Some("SKT"),
        "mms.kt.co.kr" => Some("KT"),
        "mmsmail.uplus.co.kr" => Some("LGU+"),
        _ => None,
    }
}

pub fn is_valid_nonce(value: &str) -> bool {
    value.len() == NONCE_HEX_LENGTH && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn normalize_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Matches the first `digits-and-dashes@domain` substring of a sender
/// address and maps the domain through the carrier table. An unknown domain
/// still yields the phone; a blank or non-matching input yields neither.
pub fn extract_phone_and_carrier(from_address: &str) -> (Option<String>, Option<String>) {
    if from_address.trim().is_empty() {
        return (None, None);
    }
    let Some(captures) = PHONE_RE.captures(from_address) else {
        return (None, None);
    };
    let phone = normalize_digits(&captures[1]);
    let domain = captures[2].to_lowercase();
    let carrier = carrier_for_domain(&domain).map(|c| c.to_string());
    (Some(phone), carrier)
}

/// Decoded body text plus the lowercased header map.
pub fn parse_body(raw: &[u8]) -> (String, HashMap<String, String>) {
    let (header_bytes, body_bytes) = split_header_body(raw);
    let headers = parse_headers(header_bytes);
    let mut body_text = extract_text_from_body(body_bytes, &headers, 0);
    if body_text.is_empty() {
        body_text = decode_ascii(raw);
    }
    (body_text, headers)
}

/// Splits on the first `\r\n\r\n` or `\n\n`. With no separator the whole
/// buffer is headers and the body is empty.
pub fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(idx) = find_subsequence(raw, b"\r\n\r\n") {
        return (&raw[..idx], &raw[idx + 4..]);
    }
    if let Some(idx) = find_subsequence(raw, b"\n\n") {
        return (&raw[..idx], &raw[idx + 2..]);
    }
    (raw, &[])
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Tolerant line-by-line recovery of the `From` header. Accepts lone LF
/// terminators and continuation lines starting with space or tab.
pub fn extract_header_from_raw(raw: &[u8]) -> String {
    let text = decode_ascii(raw);
    let mut current_name = String::new();
    let mut current_value = String::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if !current_name.is_empty() {
                current_value.push(' ');
                current_value.push_str(line.trim());
            }
            continue;
        }
        if current_name.eq_ignore_ascii_case("from") {
            return current_value.trim().to_string();
        }
        current_name.clear();
        current_value.clear();
        if let Some((name, value)) = line.split_once(':') {
            current_name = name.trim().to_string();
            current_value = value.trim().to_string();
        }
    }
    if current_name.eq_ignore_ascii_case("from") {
        return current_value.trim().to_string();
    }
    String::new()
}

fn find_nonce(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    let captures = NONCE_RE.captures(text)?;
    let candidate = captures[1].to_string();
    is_valid_nonce(&candidate).then_some(candidate)
}

/// Tries the decoded body text, then the raw body as ASCII, then the raw
/// body after quoted-printable and base64 decoding. Gateways disagree about
/// whether the transfer encoding they declare is the one they used.
pub fn find_nonce_with_fallback(body_text: &str, body: &[u8]) -> Option<String> {
    if let Some(nonce) = find_nonce(body_text) {
        return Some(nonce);
    }
    if let Some(nonce) = find_nonce(&decode_ascii(body)) {
        return Some(nonce);
    }
    if let Some(decoded) = decode_quoted_printable(body) {
        if let Some(nonce) = find_nonce(&decode_ascii(&decoded)) {
            return Some(nonce);
        }
    }
    if let Some(decoded) = decode_base64(body) {
        if let Some(nonce) = find_nonce(&decode_ascii(&decoded)) {
            return Some(nonce);
        }
    }
    None
}

/// Lowercased header map. Duplicate headers are comma-joined; folded
/// continuations are appended with a single space.
fn parse_headers(raw: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut last_key = String::new();
    let text = String::from_utf8_lossy(raw);
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if !last_key.is_empty() {
                if let Some(existing) = headers.get_mut(&last_key) {
                    let folded = format!("{} {}", existing, line.trim());
                    *existing = folded.trim().to_string();
                }
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let key = name.trim().to_lowercase();
        let value = value.trim().to_string();
        if let Some(existing) = headers.get_mut(&key) {
            existing.push_str(", ");
            existing.push_str(&value);
        } else {
            headers.insert(key.clone(), value);
        }
        last_key = key;
    }
    headers
}

fn extract_text_from_body(body: &[u8], headers: &HashMap<String, String>, depth: usize) -> String {
    if depth > 5 {
        return decode_ascii(body);
    }
    let content_type = headers.get("content-type").map(String::as_str).unwrap_or("");
    let (mime_type, params) = parse_content_type(content_type);
    if mime_type.starts_with("multipart/") {
        let Some(boundary) = params.get("boundary") else {
            return String::new();
        };
        let mut texts = Vec::new();
        for part in split_multipart(body, boundary) {
            let (part_header, part_body) = split_header_body(&part);
            let part_headers = parse_headers(part_header);
            let text = extract_text_from_body(part_body, &part_headers, depth + 1);
            if !text.trim().is_empty() {
                texts.push(text);
            }
        }
        return texts.join("\n");
    }
    let encoding = headers
        .get("content-transfer-encoding")
        .map(String::as_str)
        .unwrap_or("");
    let decoded = decode_transfer(body, encoding);
    if mime_type.starts_with("text/") || mime_type.is_empty() {
        return decode_ascii(&decoded);
    }
    String::new()
}

pub(crate) fn parse_content_type(value: &str) -> (String, HashMap<String, String>) {
    let value = value.trim();
    if value.is_empty() {
        return (String::new(), HashMap::new());
    }
    let mut parts = value.split(';');
    let mime_type = parts
        .next()
        .map(|p| p.trim().to_lowercase())
        .unwrap_or_default();
    let mut params = HashMap::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((key, val)) = part.split_once('=') {
            params.insert(
                key.trim().to_lowercase(),
                val.trim().trim_matches('"').to_string(),
            );
        }
    }
    (mime_type, params)
}

fn split_multipart(body: &[u8], boundary: &str) -> Vec<Vec<u8>> {
    let delim = format!("--{boundary}");
    let end_delim = format!("--{boundary}--");
    let mut parts = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut in_part = false;

    for line in split_lines_keep_ends(body) {
        let trimmed = trim_line_ending(line);
        if trimmed.starts_with(delim.as_bytes()) {
            if in_part && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            if trimmed.starts_with(end_delim.as_bytes()) {
                return parts;
            }
            in_part = true;
            continue;
        }
        if in_part {
            current.extend_from_slice(line);
        }
    }
    if in_part && !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn split_lines_keep_ends(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = body;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn decode_transfer(body: &[u8], encoding: &str) -> Vec<u8> {
    match encoding.trim().to_lowercase().as_str() {
        "base64" => decode_base64(body).unwrap_or_else(|| body.to_vec()),
        "quoted-printable" => decode_quoted_printable(body).unwrap_or_else(|| body.to_vec()),
        _ => body.to_vec(),
    }
}

/// Projects the buffer onto its ASCII bytes, dropping everything else.
fn decode_ascii(data: &[u8]) -> String {
    data.iter()
        .filter(|&&b| b < 0x80)
        .map(|&b| b as char)
        .collect()
}

fn decode_base64(body: &[u8]) -> Option<Vec<u8>> {
    let cleaned: Vec<u8> = body
        .iter()
        .filter(|&&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .copied()
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(decoded) = general_purpose::STANDARD.decode(&cleaned) {
        return Some(decoded);
    }
    general_purpose::STANDARD_NO_PAD.decode(&cleaned).ok()
}

fn decode_quoted_printable(body: &[u8]) -> Option<Vec<u8>> {
    let mut result = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b != b'=' {
            result.push(b);
            i += 1;
            continue;
        }
        // Soft line break: "=\r\n" or "=\n" joins lines.
        if body.get(i + 1) == Some(&b'\r') && body.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if body.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        let hi = body.get(i + 1).copied()?;
        let lo = body.get(i + 2).copied()?;
        let hi = hex_value(hi)?;
        let lo = hex_value(lo)?;
        result.push((hi << 4) | lo);
        i += 3;
    }
    Some(result)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_nonce() {
        let good = "a".repeat(NONCE_HEX_LENGTH);
        assert!(is_valid_nonce(&good));
        assert!(!is_valid_nonce(&format!("{good}0")));
        assert!(!is_valid_nonce(&format!("{}z", &good[..63])));
    }

    #[test]
    fn test_extract_phone_and_carrier() {
        let (phone, carrier) = extract_phone_and_carrier("010-1234-5678@mms.kt.co.kr");
        assert_eq!(phone.as_deref(), Some("01012345678"));
        assert_eq!(carrier.as_deref(), Some("KT"));

        let (phone, carrier) = extract_phone_and_carrier("01011112222@example.com");
        assert_eq!(phone.as_deref(), Some("01011112222"));
        assert_eq!(carrier, None);

        let (phone, carrier) = extract_phone_and_carrier("  ");
        assert_eq!(phone, None);
        assert_eq!(carrier, None);
    }

    #[test]
    fn test_extract_phone_and_carrier_uplus_and_skt() {
        let (_, carrier) = extract_phone_and_carrier("01099998888@mmsmail.uplus.co.kr");
        assert_eq!(carrier.as_deref(), Some("LGU+"));

        let (_, carrier) = extract_phone_and_carrier("Sender <010-1111-2222@VMMS.NATE.COM>");
        assert_eq!(carrier.as_deref(), Some("SKT"));
    }

    #[test]
    fn test_parse_body_multipart_base64() {
        let nonce = "a".repeat(NONCE_HEX_LENGTH);
        let text = format!("hello [MAPAE:{nonce}] world");
        let encoded = general_purpose::STANDARD.encode(text.as_bytes());
        let raw = [
            "From: 010-1234-5678@mms.kt.co.kr",
            "Content-Type: multipart/mixed; boundary=abc",
            "",
            "--abc",
            "Content-Type: text/plain; charset=utf-8",
            "Content-Transfer-Encoding: base64",
            "",
            &encoded,
            "--abc--",
            "",
        ]
        .join("\r\n");

        let (body, headers) = parse_body(raw.as_bytes());
        assert!(body.contains(&text), "decoded body = {body:?}");
        assert_eq!(
            headers.get("from").map(String::as_str),
            Some("010-1234-5678@mms.kt.co.kr")
        );
    }

    #[test]
    fn test_find_nonce_with_fallback() {
        let nonce = "b".repeat(NONCE_HEX_LENGTH);
        let encoded = general_purpose::STANDARD.encode(format!("prefix [MAPAE:{nonce}] suffix"));

        let got = find_nonce_with_fallback("no nonce here", encoded.as_bytes());
        assert_eq!(got.as_deref(), Some(nonce.as_str()));

        assert_eq!(find_nonce_with_fallback("", b"nothing"), None);
    }

    #[test]
    fn test_find_nonce_rejects_wrong_length() {
        let short = "c".repeat(NONCE_HEX_LENGTH - 1);
        let text = format!("[MAPAE:{short}]");
        assert_eq!(find_nonce_with_fallback(&text, text.as_bytes()), None);
    }

    #[test]
    fn test_extract_header_from_raw_and_split_header_body() {
        let raw = [
            "From: Sender",
            " \t<01012345678@mmsmail.uplus.co.kr>",
            "Subject: test",
            "",
            "body",
        ]
        .join("\n");

        let from = extract_header_from_raw(raw.as_bytes());
        assert!(
            from.contains("01012345678@mmsmail.uplus.co.kr"),
            "from = {from:?}"
        );

        let (header, body) = split_header_body(b"A: b\r\n\r\nhello");
        assert_eq!(header, b"A: b");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_split_header_body_without_separator() {
        let (header, body) = split_header_body(b"just headers");
        assert_eq!(header, b"just headers");
        assert!(body.is_empty());
    }

    #[test]
    fn test_parse_headers_joins_duplicates() {
        let raw = b"X-One: a\nX-One: b\n\n";
        let headers = parse_headers(raw);
        assert_eq!(headers.get("x-one").map(String::as_str), Some("a, b"));
    }

    #[test]
    fn test_quoted_printable_decoding() {
        assert_eq!(
            decode_quoted_printable(b"Hello=20World=21").as_deref(),
            Some(b"Hello World!".as_slice())
        );
        assert_eq!(
            decode_quoted_printable(b"Hello=\r\nWorld").as_deref(),
            Some(b"HelloWorld".as_slice())
        );
        assert_eq!(decode_quoted_printable(b"bad=zzescape"), None);
    }
}
