//! Inbound message parsing
//!
//! Two passes over the same problem: a streaming scanner that walks the
//! MIME tree without buffering it, and a permissive whole-buffer parser
//! that recovers from the structural damage carrier gateways inflict. On
//! well-formed input they agree; the session prefers the stream scanner and
//! falls back to the permissive pass.

pub mod permissive;
pub mod stream;

pub use permissive::{
    extract_header_from_raw, extract_phone_and_carrier, find_nonce_with_fallback, is_valid_nonce,
    parse_body, split_header_body, NONCE_HEX_LENGTH,
};
pub use stream::{scan_message, NonceScanner, ScanError, ScanOutcome};
