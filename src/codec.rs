//! Text codec for the wire protocol
//!
//! Converts raw socket bytes to text and back using the session's
//! configured encoding and error policy. Decoding never fails: malformed
//! byte sequences are handled by the `ErrorPolicy`, so a bad frame can
//! never break line framing.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProtocolError};
use crate::message::{Frame, ServerMessage};

/// Supported text encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin-1",
        }
    }

    /// Highest code point representable in a single unit of this encoding
    fn max_char(&self) -> Option<u32> {
        match self {
            Encoding::Utf8 => None,
            Encoding::Ascii => Some(0x7F),
            Encoding::Latin1 => Some(0xFF),
        }
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            _ => Err(ConfigError::UnknownEncoding(s.to_string())),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        value.name().to_string()
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with bytes (or characters) the encoding cannot represent
///
/// `strict` is deliberately absent: a decode must never fail a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorPolicy {
    /// U+FFFD when decoding, `?` when encoding
    Replace,
    /// Drop the offending input
    Ignore,
    /// `\xNN` escapes when decoding, `\xNN`/`\uNNNN`/`\UNNNNNNNN` when encoding
    BackslashReplace,
}

impl ErrorPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorPolicy::Replace => "replace",
            ErrorPolicy::Ignore => "ignore",
            ErrorPolicy::BackslashReplace => "backslashreplace",
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ErrorPolicy::Replace),
            "ignore" => Ok(ErrorPolicy::Ignore),
            "backslashreplace" => Ok(ErrorPolicy::BackslashReplace),
            _ => Err(ConfigError::UnknownErrorPolicy(s.to_string())),
        }
    }
}

impl TryFrom<String> for ErrorPolicy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ErrorPolicy> for String {
    fn from(value: ErrorPolicy) -> Self {
        value.name().to_string()
    }
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encoding parameters of one session
///
/// Starts from the server config and may be overridden per session with
/// `ENCODING` / `ENCODING_ERRORS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub encoding: Encoding,
    pub errors: ErrorPolicy,
}

impl Codec {
    pub fn new(encoding: Encoding, errors: ErrorPolicy) -> Self {
        Self { encoding, errors }
    }

    /// Decode raw bytes into text. Never fails.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => self.decode_utf8(bytes),
            Encoding::Ascii => {
                let mut out = String::with_capacity(bytes.len());
                for &b in bytes {
                    if b.is_ascii() {
                        out.push(char::from(b));
                    } else {
                        self.push_invalid_byte(&mut out, b);
                    }
                }
                out
            }
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    fn decode_utf8(&self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len());
        for chunk in bytes.utf8_chunks() {
            out.push_str(chunk.valid());
            let invalid = chunk.invalid();
            if invalid.is_empty() {
                continue;
            }
            match self.errors {
                ErrorPolicy::Replace => out.push(char::REPLACEMENT_CHARACTER),
                ErrorPolicy::Ignore => {}
                ErrorPolicy::BackslashReplace => {
                    for &b in invalid {
                        let _ = write!(out, "\\x{:02x}", b);
                    }
                }
            }
        }
        out
    }

    fn push_invalid_byte(&self, out: &mut String, b: u8) {
        match self.errors {
            ErrorPolicy::Replace => out.push(char::REPLACEMENT_CHARACTER),
            ErrorPolicy::Ignore => {}
            ErrorPolicy::BackslashReplace => {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
    }

    /// Encode text into bytes. Characters the encoding cannot represent
    /// go through the error policy.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let Some(max) = self.encoding.max_char() else {
            return text.as_bytes().to_vec();
        };

        let mut out = Vec::with_capacity(text.len());
        for c in text.chars() {
            let code = u32::from(c);
            if code <= max {
                // code fits in one byte here
                out.push(code as u8);
                continue;
            }
            match self.errors {
                ErrorPolicy::Replace => out.push(b'?'),
                ErrorPolicy::Ignore => {}
                ErrorPolicy::BackslashReplace => {
                    let escaped = if code <= 0xFF {
                        format!("\\x{:02x}", code)
                    } else if code <= 0xFFFF {
                        format!("\\u{:04x}", code)
                    } else {
                        format!("\\U{:08x}", code)
                    };
                    out.extend_from_slice(escaped.as_bytes());
                }
            }
        }
        out
    }

    /// Whether plain ASCII text survives an encode/decode cycle
    pub fn round_trips(&self, sample: &str) -> bool {
        self.encode(sample) == sample.as_bytes() && self.decode(sample.as_bytes()) == sample
    }

    /// Decode one line (terminator already removed) into a frame
    pub fn decode_frame(&self, bytes: &[u8]) -> Frame {
        Frame::parse(&self.decode(bytes))
    }

    /// Encode a frame as a single `HEADER[:PAYLOAD]\n` line
    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.encode(&frame.to_line()?))
    }

    /// Encode a server reply; may span several lines (e.g. `DUMP`)
    pub fn encode_message(&self, msg: &ServerMessage) -> Vec<u8> {
        self.encode(&msg.to_wire())
    }
}

/// Split complete lines off the front of `pending`
///
/// Returns each line without its `\n` (and without a trailing `\r`).
/// Bytes after the last terminator stay in `pending`.
pub fn take_lines(pending: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(line);
    }
    lines
}
