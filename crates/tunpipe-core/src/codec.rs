//! Base64 façade for the text-framed transports.
//!
//! Standard alphabet with RFC 4648 padding, matching what both peers of
//! the HTTP and XMPP framings expect on the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

/// Encode raw bytes to padded base64.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode padded base64; a malformed body is a peer protocol violation.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim_end_matches(['\r', '\n']))
        .map_err(|e| Error::Protocol(format!("bad base64 body: {e}")))
}

/// Whether `text` is a well-formed padded base64 string.
pub fn is_valid(text: &str) -> bool {
    STANDARD.decode(text).is_ok()
}
