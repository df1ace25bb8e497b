//! Message protocol definitions
//!
//! Line-oriented text protocol, one frame per line: `HEADER[:PAYLOAD]\n`.
//! - `Frame`: a decoded client -> server command
//! - `ServerMessage`: every server -> client reply

use crate::error::{ProtocolError, RegistryError};
use crate::types::ClientId;

/// Display name used for sessions that never sent `USERNAME`
pub const ANONYMOUS: &str = "anonymous";

/// Client -> server command header
///
/// Tokens are case-sensitive. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    Username,
    Encoding,
    EncodingErrors,
    Msg,
    Dm,
    Users,
    Dump,
    Kick,
    Ban,
    Quit,
    Kill,
    Unknown,
}

impl Header {
    /// All recognized headers (excludes `Unknown`)
    pub const ALL: [Header; 11] = [
        Header::Username,
        Header::Encoding,
        Header::EncodingErrors,
        Header::Msg,
        Header::Dm,
        Header::Users,
        Header::Dump,
        Header::Kick,
        Header::Ban,
        Header::Quit,
        Header::Kill,
    ];

    pub fn from_token(token: &str) -> Self {
        match token {
            "USERNAME" => Header::Username,
            "ENCODING" => Header::Encoding,
            "ENCODING_ERRORS" => Header::EncodingErrors,
            "MSG" => Header::Msg,
            "DM" => Header::Dm,
            "USERS" => Header::Users,
            "DUMP" => Header::Dump,
            "KICK" => Header::Kick,
            "BAN" => Header::Ban,
            "QUIT" => Header::Quit,
            "KILL" => Header::Kill,
            _ => Header::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Header::Username => "USERNAME",
            Header::Encoding => "ENCODING",
            Header::EncodingErrors => "ENCODING_ERRORS",
            Header::Msg => "MSG",
            Header::Dm => "DM",
            Header::Users => "USERS",
            Header::Dump => "DUMP",
            Header::Kick => "KICK",
            Header::Ban => "BAN",
            Header::Quit => "QUIT",
            Header::Kill => "KILL",
            Header::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded client frame
///
/// For `Header::Unknown` the payload holds the unrecognized token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: String,
}

impl Frame {
    pub fn new(header: Header, payload: impl Into<String>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Parse one line of text (terminator already removed)
    ///
    /// Splits on the first `:`. Never fails.
    pub fn parse(line: &str) -> Self {
        let (token, payload) = line.split_once(':').unwrap_or((line, ""));
        match Header::from_token(token) {
            Header::Unknown => Frame::new(Header::Unknown, token),
            header => Frame::new(header, payload),
        }
    }

    /// Render as a single wire line including the trailing `\n`
    ///
    /// Only recognized headers can be rendered: an `Unknown` frame has no
    /// header of its own and would read back as whatever its token names.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        if self.header == Header::Unknown {
            return Err(ProtocolError::UnknownHeader(self.payload.clone()));
        }
        if self.payload.contains(['\n', '\r']) {
            return Err(ProtocolError::EmbeddedLineTerminator);
        }
        if self.payload.is_empty() {
            Ok(format!("{}\n", self.header.as_str()))
        } else {
            Ok(format!("{}:{}\n", self.header.as_str(), self.payload))
        }
    }
}

/// One entry of a `USERS` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub id: ClientId,
    pub username: Option<String>,
}

/// One logged broadcast replayed by `DUMP`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub from_id: ClientId,
    pub from_name: String,
    pub text: String,
}

/// Server -> client reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Connection accepted, client ID issued
    Welcome { client_id: ClientId },
    /// Broadcast chat message from another session
    Chat {
        from_id: ClientId,
        from_name: String,
        text: String,
    },
    /// Direct message
    Direct {
        from_id: ClientId,
        from_name: String,
        text: String,
    },
    /// Current membership, in id order
    Users(Vec<UserEntry>),
    /// Replay of the recent-message log
    History(Vec<LoggedMessage>),
    /// Command succeeded
    Ok(String),
    /// Command failed
    Error { code: ErrorCode, message: String },
    /// Connection is about to be closed by the server
    Bye(String),
}

impl ServerMessage {
    pub fn ok(text: impl Into<String>) -> Self {
        ServerMessage::Ok(text.into())
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Wire representation, one or more `\n`-terminated lines
    pub fn to_wire(&self) -> String {
        match self {
            ServerMessage::Welcome { client_id } => format!("WELCOME:{}\n", client_id),
            ServerMessage::Chat {
                from_id,
                from_name,
                text,
            } => format!(
                "MSG:{}:{}:{}\n",
                from_id,
                single_line(from_name),
                single_line(text)
            ),
            ServerMessage::Direct {
                from_id,
                from_name,
                text,
            } => format!(
                "DM:{}:{}:{}\n",
                from_id,
                single_line(from_name),
                single_line(text)
            ),
            ServerMessage::Users(users) => {
                let list = users
                    .iter()
                    .map(|u| format!("{}={}", u.id, single_line(u.username.as_deref().unwrap_or(""))))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("USERS:{}\n", list)
            }
            ServerMessage::History(entries) => {
                let mut out = String::new();
                for entry in entries {
                    out.push_str(&format!(
                        "DUMP:{}:{}:{}\n",
                        entry.from_id,
                        single_line(&entry.from_name),
                        single_line(&entry.text)
                    ));
                }
                out.push_str(&format!("OK:dumped {} messages\n", entries.len()));
                out
            }
            ServerMessage::Ok(text) => format!("OK:{}\n", single_line(text)),
            ServerMessage::Error { code, message } => {
                format!("ERROR:{}:{}\n", code.as_str(), single_line(message))
            }
            ServerMessage::Bye(reason) => format!("BYE:{}\n", single_line(reason)),
        }
    }
}

/// Replace line terminators so user text can never split a frame
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Second `USERNAME` for the same session
    AlreadySet,
    /// Username empty, too long, or containing reserved characters
    InvalidUsername,
    /// Target id not in the registry
    NoSuchUser,
    /// Target id is not a number
    InvalidTarget,
    /// `ENCODING` with an unsupported name
    UnknownEncoding,
    /// `ENCODING_ERRORS` with an unsupported policy
    UnknownPolicy,
    /// Unrecognized header
    UnknownHeader,
    /// Line longer than the read buffer
    FrameTooLong,
    /// Admin command refused by policy
    NotPermitted,
    /// Connection refused: server at capacity
    ServerFull,
    /// Connection refused: address banned
    Banned,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadySet => "already_set",
            ErrorCode::InvalidUsername => "invalid_username",
            ErrorCode::NoSuchUser => "no_such_user",
            ErrorCode::InvalidTarget => "invalid_target",
            ErrorCode::UnknownEncoding => "unknown_encoding",
            ErrorCode::UnknownPolicy => "unknown_policy",
            ErrorCode::UnknownHeader => "unknown_header",
            ErrorCode::FrameTooLong => "frame_too_long",
            ErrorCode::NotPermitted => "not_permitted",
            ErrorCode::ServerFull => "server_full",
            ErrorCode::Banned => "banned",
        }
    }
}

/// Convert RegistryError to ServerMessage for client notification
impl From<RegistryError> for ServerMessage {
    fn from(err: RegistryError) -> Self {
        let code = match &err {
            RegistryError::AlreadySet(_) => ErrorCode::AlreadySet,
            RegistryError::NoSuchUser(_) => ErrorCode::NoSuchUser,
        };
        ServerMessage::error(code, err.to_string())
    }
}

/// Convert ProtocolError to ServerMessage for client notification
impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::UnknownHeader(_) | ProtocolError::EmbeddedLineTerminator => {
                ErrorCode::UnknownHeader
            }
            ProtocolError::FrameTooLong(_) => ErrorCode::FrameTooLong,
        };
        ServerMessage::error(code, err.to_string())
    }
}
