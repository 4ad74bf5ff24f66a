//! Streaming nonce scanner
//!
//! Walks a MIME message incrementally: the header block and small fixed
//! decoder buffers are the only steady-state memory, so a hostile message
//! costs O(limit) regardless of attachment size. The scanner feeds every
//! decoded leaf byte through a finite-state matcher for the bracketed
//! `[MAPAE:<64 hex>]` token.

use std::io::{BufReader, Read};

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

use super::permissive::{parse_content_type, NONCE_HEX_LENGTH};

/// Parts nested deeper than this are consumed but never scanned.
const MAX_MIME_DEPTH: usize = 5;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("message_too_large")]
    MessageTooLarge,

    #[error("malformed header line: {0}")]
    Header(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct ScanOutcome {
    /// Original `From` header value, whitespace-normalized. Empty if absent.
    pub header_from: String,
    pub nonce: Option<String>,
    pub bytes_read: usize,
}

/// Reads the message once, front to back. Fails with `MessageTooLarge` as
/// soon as more than `limit` bytes have been consumed (`limit == 0` means
/// unlimited); callers must not assume the stream was drained after an
/// error.
pub fn scan_message<R: Read>(reader: R, limit: usize) -> Result<ScanOutcome, ScanError> {
    let mut lines = LineReader::new(reader, limit);

    let headers = read_header_block(&mut lines)?;
    let header_from = header_get(&headers, "from").unwrap_or_default();

    let mut scanner = NonceScanner::new();
    let mut stack: Vec<String> = Vec::new();
    let mut leaf = open_entity(&headers, 0, &mut stack);

    let mut line = Vec::new();
    loop {
        line.clear();
        if lines.next_line(&mut line)? == 0 {
            break;
        }
        if let Some(hit) = match_boundary(&line, &stack) {
            leaf.flush(&mut scanner);
            match hit {
                BoundaryHit::Open(idx) => {
                    stack.truncate(idx + 1);
                    let part_headers = read_header_block(&mut lines)?;
                    let depth = stack.len();
                    leaf = open_entity(&part_headers, depth, &mut stack);
                }
                BoundaryHit::Close(idx) => {
                    stack.truncate(idx);
                    leaf = Leaf::Discard;
                }
            }
            continue;
        }
        leaf.feed(&line, &mut scanner);
    }
    leaf.flush(&mut scanner);

    Ok(ScanOutcome {
        header_from,
        nonce: scanner.into_found(),
        bytes_read: lines.read,
    })
}

/// Byte-counting line source. Lines keep their terminator so identity
/// leaves see the original byte stream.
struct LineReader<R> {
    inner: BufReader<R>,
    limit: usize,
    read: usize,
}

impl<R: Read> LineReader<R> {
    fn new(reader: R, limit: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            limit,
            read: 0,
        }
    }

    /// Appends the next line to `buf` and returns its length; 0 means EOF.
    fn next_line(&mut self, buf: &mut Vec<u8>) -> Result<usize, ScanError> {
        use std::io::BufRead;
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Ok(buf.len());
            }
            let (take, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            if self.limit > 0 && self.read + take > self.limit {
                self.read += take;
                self.inner.consume(take);
                return Err(ScanError::MessageTooLarge);
            }
            buf.extend_from_slice(&available[..take]);
            self.read += take;
            self.inner.consume(take);
            if complete {
                return Ok(buf.len());
            }
        }
    }
}

/// Reads a header block up to the first blank line. Lone LF terminators and
/// folded continuations are accepted; a non-continuation line without a
/// colon is not.
fn read_header_block<R: Read>(
    lines: &mut LineReader<R>,
) -> Result<Vec<(String, String)>, ScanError> {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if lines.next_line(&mut line)? == 0 {
            break;
        }
        let text = trim_line_ending(&line);
        if text.is_empty() {
            break;
        }
        if text[0] == b' ' || text[0] == b'\t' {
            if let Some((_, value)) = headers.last_mut() {
                let continuation = String::from_utf8_lossy(text);
                value.push(' ');
                value.push_str(continuation.trim());
            }
            continue;
        }
        let text = String::from_utf8_lossy(text);
        let Some((name, value)) = text.split_once(':') else {
            return Err(ScanError::Header(text.trim().to_string()));
        };
        headers.push((name.trim().to_lowercase(), value.trim().to_string()));
    }
    Ok(headers)
}

fn header_get(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

enum BoundaryHit {
    Open(usize),
    Close(usize),
}

/// Matches a line against every boundary on the stack, innermost first.
/// Matching any ancestor boundary implicitly closes the parts nested inside
/// it, which is how broken nesting from gateways gets tolerated.
fn match_boundary(line: &[u8], stack: &[String]) -> Option<BoundaryHit> {
    let mut trimmed = trim_line_ending(line);
    while let [rest @ .., b' ' | b'\t'] = trimmed {
        trimmed = rest;
    }
    let body = trimmed.strip_prefix(b"--")?;
    for idx in (0..stack.len()).rev() {
        let boundary = stack[idx].as_bytes();
        if body == boundary {
            return Some(BoundaryHit::Open(idx));
        }
        if body.len() == boundary.len() + 2
            && &body[..boundary.len()] == boundary
            && &body[boundary.len()..] == b"--"
        {
            return Some(BoundaryHit::Close(idx));
        }
    }
    None
}

/// Decides how the body that follows a header block is consumed. Multipart
/// entities push their boundary and discard the preamble; leaves pick a
/// transfer decoder. Anything past the depth cap is consumed unscanned.
fn open_entity(headers: &[(String, String)], depth: usize, stack: &mut Vec<String>) -> Leaf {
    let content_type = header_get(headers, "content-type").unwrap_or_default();
    let (media_type, params) = parse_content_type(&content_type);

    if media_type.starts_with("multipart/") {
        if let Some(boundary) = params.get("boundary").filter(|b| !b.is_empty()) {
            if depth > MAX_MIME_DEPTH {
                return Leaf::Discard;
            }
            stack.push(boundary.clone());
            return Leaf::Discard;
        }
    }

    if depth > MAX_MIME_DEPTH {
        return Leaf::Discard;
    }
    let encoding = header_get(headers, "content-transfer-encoding").unwrap_or_default();
    Leaf::for_encoding(&encoding)
}

/// Per-leaf transfer decoder feeding the nonce matcher. A malformed
/// encoding poisons the leaf: the rest of it is consumed without scanning
/// and the walk resumes at the next boundary.
enum Leaf {
    Identity,
    Base64 { chunk: Vec<u8>, poisoned: bool },
    QuotedPrintable { poisoned: bool },
    Discard,
}

impl Leaf {
    fn for_encoding(encoding: &str) -> Self {
        match encoding.trim().to_lowercase().as_str() {
            "base64" => Leaf::Base64 {
                chunk: Vec::with_capacity(4),
                poisoned: false,
            },
            "quoted-printable" => Leaf::QuotedPrintable { poisoned: false },
            _ => Leaf::Identity,
        }
    }

    fn feed(&mut self, line: &[u8], scanner: &mut NonceScanner) {
        match self {
            Leaf::Identity => scanner.scan(line),
            Leaf::Base64 { chunk, poisoned } => {
                if *poisoned {
                    return;
                }
                for &b in line {
                    if matches!(b, b' ' | b'\t' | b'\r' | b'\n') {
                        continue;
                    }
                    chunk.push(b);
                    if chunk.len() == 4 {
                        match general_purpose::STANDARD.decode(chunk.as_slice()) {
                            Ok(decoded) => scanner.scan(&decoded),
                            Err(_) => {
                                *poisoned = true;
                                return;
                            }
                        }
                        chunk.clear();
                    }
                }
            }
            Leaf::QuotedPrintable { poisoned } => {
                if *poisoned {
                    return;
                }
                let content = trim_line_ending(line);
                let had_terminator = content.len() != line.len();
                let (content, soft_break) = match content.strip_suffix(b"=") {
                    Some(rest) if had_terminator => (rest, true),
                    _ => (content, false),
                };
                match decode_qp_fragment(content) {
                    Some(decoded) => {
                        scanner.scan(&decoded);
                        if had_terminator && !soft_break {
                            scanner.scan(b"\n");
                        }
                    }
                    None => *poisoned = true,
                }
            }
            Leaf::Discard => {}
        }
    }

    fn flush(&mut self, scanner: &mut NonceScanner) {
        if let Leaf::Base64 { chunk, poisoned } = self {
            // A trailing group of 2 or 3 characters is legal unpadded base64.
            if !*poisoned && chunk.len() >= 2 {
                if let Ok(decoded) = general_purpose::STANDARD_NO_PAD.decode(chunk.as_slice()) {
                    scanner.scan(&decoded);
                }
            }
            chunk.clear();
        }
    }
}

fn decode_qp_fragment(content: &[u8]) -> Option<Vec<u8>> {
    let mut decoded = Vec::with_capacity(content.len());
    let mut i = 0;
    while i < content.len() {
        let b = content[i];
        if b != b'=' {
            decoded.push(b);
            i += 1;
            continue;
        }
        let hi = hex_value(*content.get(i + 1)?)?;
        let lo = hex_value(*content.get(i + 2)?)?;
        decoded.push((hi << 4) | lo);
        i += 3;
    }
    Some(decoded)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Byte-at-a-time matcher for `[MAPAE:<64 hex>]`, case-insensitive in the
/// prefix. States 0..7 track progress through the literal; state 7
/// accumulates hex digits. Whitespace or a non-hex byte inside the digit
/// region resets the match, and `[` re-enters state 1 so overlapping
/// candidates are not missed.
pub struct NonceScanner {
    state: u8,
    digits: Vec<u8>,
    found: Option<String>,
}

impl NonceScanner {
    pub fn new() -> Self {
        Self {
            state: 0,
            digits: Vec::with_capacity(NONCE_HEX_LENGTH),
            found: None,
        }
    }

    pub fn found(&self) -> bool {
        self.found.is_some()
    }

    pub fn into_found(self) -> Option<String> {
        self.found
    }

    fn reset(&mut self) {
        self.state = 0;
        self.digits.clear();
    }

    fn reset_and_maybe_start(&mut self, b: u8) {
        self.reset();
        if b == b'[' {
            self.state = 1;
        }
    }

    pub fn scan(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.found.is_some() {
                return;
            }
            self.scan_byte(b);
        }
    }

    fn scan_byte(&mut self, b: u8) {
        const PREFIX: &[u8] = b"MAPAE:";
        match self.state {
            0 => {
                if b == b'[' {
                    self.state = 1;
                }
            }
            1..=6 => {
                let expected = PREFIX[(self.state - 1) as usize];
                if b.eq_ignore_ascii_case(&expected) {
                    self.state += 1;
                    if self.state == 7 {
                        self.digits.clear();
                    }
                } else {
                    self.reset_and_maybe_start(b);
                }
            }
            _ => match b {
                b']' => {
                    if self.digits.len() == NONCE_HEX_LENGTH {
                        self.found = Some(String::from_utf8_lossy(&self.digits).into_owned());
                        return;
                    }
                    self.reset();
                }
                b' ' | b'\r' | b'\n' | b'\t' => self.reset(),
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    if self.digits.len() >= NONCE_HEX_LENGTH {
                        self.reset();
                        return;
                    }
                    self.digits.push(b);
                }
                _ => self.reset_and_maybe_start(b),
            },
        }
    }
}

impl Default for NonceScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn nonce_of(ch: char) -> String {
        ch.to_string().repeat(NONCE_HEX_LENGTH)
    }

    fn scan_str(msg: &str, limit: usize) -> Result<ScanOutcome, ScanError> {
        scan_message(Cursor::new(msg.as_bytes().to_vec()), limit)
    }

    #[test]
    fn test_plain_text_message() {
        let nonce = nonce_of('c');
        let msg = format!(
            "From: 01012345678@mms.kt.co.kr\r\nContent-Type: text/plain\r\n\r\nhello [MAPAE:{nonce}]"
        );

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.header_from, "01012345678@mms.kt.co.kr");
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
        assert!(outcome.bytes_read > 0);
    }

    #[test]
    fn test_base64_leaf_with_leading_whitespace() {
        let nonce = nonce_of('d');
        let body = general_purpose::STANDARD.encode(format!("[MAPAE:{nonce}]"));
        let msg = format!(
            "From: user@example.com\r\nContent-Type: text/plain\r\nContent-Transfer-Encoding: base64\r\n\r\n  {body}\r\n"
        );

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_message_too_large() {
        let nonce = nonce_of('e');
        let msg = format!("From: user@example.com\r\n\r\n[MAPAE:{nonce}]");

        let err = scan_str(&msg, 10).unwrap_err();
        assert!(matches!(err, ScanError::MessageTooLarge));
    }

    #[test]
    fn test_no_nonce() {
        let outcome = scan_str("From: user@example.com\r\n\r\nhello", 0).unwrap();
        assert_eq!(outcome.header_from, "user@example.com");
        assert_eq!(outcome.nonce, None);
    }

    #[test]
    fn test_multipart_base64_part() {
        let nonce = nonce_of('a');
        let encoded =
            general_purpose::STANDARD.encode(format!("hello [MAPAE:{nonce}] world"));
        let msg = [
            "From: 010-1234-5678@mms.kt.co.kr",
            "Content-Type: multipart/mixed; boundary=abc",
            "",
            "preamble is ignored",
            "--abc",
            "Content-Type: text/plain; charset=utf-8",
            "Content-Transfer-Encoding: base64",
            "",
            &encoded,
            "--abc--",
            "epilogue",
            "",
        ]
        .join("\r\n");

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_nested_multipart_within_depth() {
        let nonce = nonce_of('b');
        let msg = [
            "From: user@example.com",
            "Content-Type: multipart/mixed; boundary=outer",
            "",
            "--outer",
            "Content-Type: multipart/alternative; boundary=inner",
            "",
            "--inner",
            "Content-Type: text/plain",
            "",
            &format!("[MAPAE:{nonce}]"),
            "--inner--",
            "--outer--",
            "",
        ]
        .join("\r\n");

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_depth_cap_discards_deep_parts() {
        // Six nested multiparts put the leaf at depth 7, past the cap.
        let nonce = nonce_of('f');
        let mut lines = vec![
            "From: user@example.com".to_string(),
            "Content-Type: multipart/mixed; boundary=b0".to_string(),
            String::new(),
        ];
        for i in 0..6 {
            lines.push(format!("--b{i}"));
            lines.push(format!(
                "Content-Type: multipart/mixed; boundary=b{}",
                i + 1
            ));
            lines.push(String::new());
        }
        lines.push("--b6".to_string());
        lines.push("Content-Type: text/plain".to_string());
        lines.push(String::new());
        lines.push(format!("[MAPAE:{nonce}]"));
        for i in (0..7).rev() {
            lines.push(format!("--b{i}--"));
        }
        lines.push(String::new());

        let outcome = scan_str(&lines.join("\r\n"), 0).unwrap();
        assert_eq!(outcome.nonce, None);
    }

    #[test]
    fn test_poisoned_base64_leaf_does_not_stop_later_parts() {
        let nonce = nonce_of('1');
        let msg = [
            "From: user@example.com",
            "Content-Type: multipart/mixed; boundary=xyz",
            "",
            "--xyz",
            "Content-Type: text/plain",
            "Content-Transfer-Encoding: base64",
            "",
            "!!!!not-base64!!!!",
            "--xyz",
            "Content-Type: text/plain",
            "",
            &format!("[MAPAE:{nonce}]"),
            "--xyz--",
            "",
        ]
        .join("\r\n");

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_quoted_printable_leaf() {
        let nonce = nonce_of('2');
        let msg = format!(
            "From: user@example.com\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\n=5BMAPAE:{nonce}=5D\r\n"
        );

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_quoted_printable_soft_break_spans_lines() {
        let nonce = nonce_of('3');
        let (head, tail) = nonce.split_at(30);
        let msg = format!(
            "From: user@example.com\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\n[MAPAE:{head}=\r\n{tail}]\r\n"
        );

        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_folded_from_header() {
        let msg = "From: Sender\r\n \t<01012345678@mmsmail.uplus.co.kr>\r\n\r\nbody";
        let outcome = scan_str(msg, 0).unwrap();
        assert!(outcome
            .header_from
            .contains("01012345678@mmsmail.uplus.co.kr"));
    }

    #[test]
    fn test_scanner_rejects_split_and_oversized_candidates() {
        let nonce = nonce_of('4');

        // Whitespace inside the hex region resets the match.
        let mut sc = NonceScanner::new();
        let (head, tail) = nonce.split_at(10);
        sc.scan(format!("[MAPAE:{head} {tail}]").as_bytes());
        assert!(!sc.found());

        // 65 digits overflow and reset.
        let mut sc = NonceScanner::new();
        sc.scan(format!("[MAPAE:{nonce}0]").as_bytes());
        assert!(!sc.found());

        // 63 digits are too short.
        let mut sc = NonceScanner::new();
        sc.scan(format!("[MAPAE:{}]", &nonce[..63]).as_bytes());
        assert!(!sc.found());
    }

    #[test]
    fn test_scanner_reenters_on_bracket() {
        let nonce = nonce_of('5');
        let mut sc = NonceScanner::new();
        sc.scan(format!("[MAP[MAPAE:{nonce}]").as_bytes());
        assert_eq!(sc.into_found().as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_scanner_prefix_is_case_insensitive() {
        let nonce = nonce_of('6');
        let mut sc = NonceScanner::new();
        sc.scan(format!("[mapae:{nonce}]").as_bytes());
        assert_eq!(sc.into_found().as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_first_match_wins_and_stream_is_drained() {
        let first = nonce_of('7');
        let second = nonce_of('8');
        let msg = format!(
            "From: user@example.com\r\n\r\n[MAPAE:{first}] and [MAPAE:{second}]"
        );
        let outcome = scan_str(&msg, 0).unwrap();
        assert_eq!(outcome.nonce.as_deref(), Some(first.as_str()));
        assert_eq!(outcome.bytes_read, msg.len());
    }
}
