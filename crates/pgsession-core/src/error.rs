use crate::sqlstate::SqlState;
use std::fmt;
use thiserror::Error;

/// Failures that end a session. None of these can be answered with an
/// ErrorResponse and carried on from: the byte stream is either gone or can
/// no longer be trusted to contain aligned messages.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
    #[error("connection killed by cancel request")]
    Killed,
    #[error("idle timeout after {0}s")]
    IdleTimeout(u64),
    #[error("protocol out of sync: {0}")]
    ProtocolSync(String),
    #[error("unrecognized protocol version {0}")]
    UnrecognizedVersion(i32),
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("message builder already flushed")]
    BuilderFlushed,
    #[error("connection rejected: {0}")]
    Rejected(String),
}

impl SessionError {
    pub fn sync(detail: impl Into<String>) -> Self {
        SessionError::ProtocolSync(detail.into())
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        SessionError::Protocol(detail.into())
    }

    /// True when the transport went away underneath the session (peer hangup,
    /// kill, idle timeout) rather than the peer breaking the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Stream(_) | SessionError::Killed | SessionError::IdleTimeout(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// A client-visible error, sent as an ErrorResponse. The session stays usable
/// unless the severity is `Fatal`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ErrorReport {
    pub severity: Severity,
    pub sql_state: SqlState,
    pub message: String,
}

impl ErrorReport {
    pub fn error(sql_state: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            sql_state,
            message: message.into(),
        }
    }

    pub fn fatal(sql_state: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            sql_state,
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl fmt::Display) -> Self {
        Self::error(
            SqlState::FeatureNotSupported,
            format!("{what} is not supported"),
        )
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.severity.as_str(),
            self.sql_state.code(),
            self.message
        )
    }
}

/// Outcome of a single frontend command handler.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Client(#[from] ErrorReport),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        CommandError::Session(SessionError::Stream(err))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
pub type CommandResult<T> = Result<T, CommandError>;
