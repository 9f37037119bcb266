use pgsession_core::{ErrorReport, SqlState};
use std::collections::HashMap;

/// Protocol 3.0, the only version accepted.
pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// pg_type.oid of `text`; every result column is reported as text.
pub const TEXT_OID: i32 = 25;

/// The untagged first packet of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup {
        protocol_version: i32,
        params: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query { sql: String },
    /// Extended query: Parse (P)
    Parse {
        statement_name: String,
        query: String,
        param_oids: Vec<i32>,
    },
    /// Extended query: Bind (B). Format codes are as sent; see
    /// [`expand_format_codes`] for the shorthand forms.
    Bind {
        portal_name: String,
        statement_name: String,
        param_format_codes: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_format_codes: Vec<i16>,
    },
    /// Extended query: Describe (D)
    Describe { target: DescribeTarget, name: String },
    /// Extended query: Execute (E)
    Execute { portal_name: String, max_rows: i32 },
    /// Extended query: Close (C) - close portal or statement
    Close { target: CloseTarget, name: String },
    /// Extended query: Flush (H) - request backend to flush output buffer
    Flush,
    /// Extended query: Sync (S)
    Sync,
    /// Legacy function call sub-protocol (F)
    FunctionCall {
        object_id: i32,
        arg_format_codes: Vec<i16>,
        args: Vec<Option<Vec<u8>>>,
        result_format: i16,
    },
    CopyData { data: Vec<u8> },
    CopyDone,
    CopyFail { message: String },
    Terminate,
}

impl FrontendMessage {
    pub fn tag(&self) -> u8 {
        match self {
            FrontendMessage::Query { .. } => b'Q',
            FrontendMessage::Parse { .. } => b'P',
            FrontendMessage::Bind { .. } => b'B',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Sync => b'S',
            FrontendMessage::FunctionCall { .. } => b'F',
            FrontendMessage::CopyData { .. } => b'd',
            FrontendMessage::CopyDone => b'c',
            FrontendMessage::CopyFail { .. } => b'f',
            FrontendMessage::Terminate => b'X',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTarget {
    Statement,
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatCode {
    #[default]
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(FormatCode::Text),
            1 => Some(FormatCode::Binary),
            _ => None,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }
}

/// Expands Bind's format-code shorthand to one code per value: zero codes
/// means all text, a single code applies to every value.
pub fn expand_format_codes(codes: &[i16], values: usize) -> Result<Vec<FormatCode>, ErrorReport> {
    let parsed = codes
        .iter()
        .map(|&code| {
            FormatCode::from_code(code).ok_or_else(|| {
                ErrorReport::error(
                    SqlState::ProtocolViolation,
                    format!("invalid format code {code}"),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    match parsed.len() {
        0 => Ok(vec![FormatCode::Text; values]),
        1 => Ok(vec![parsed[0]; values]),
        n if n == values => Ok(parsed),
        n => Err(ErrorReport::error(
            SqlState::ProtocolViolation,
            format!("bind message has {n} parameter formats but {values} parameters"),
        )),
    }
}

/// Transaction state for ReadyForQuery (PostgreSQL wire protocol).
/// - Idle: not in transaction block
/// - Transaction: in transaction block (after BEGIN)
/// - Error: in failed transaction, must ROLLBACK before new commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Transaction,
    Error,
}

impl TransactionState {
    pub fn wire_byte(self) -> u8 {
        match self {
            TransactionState::Idle => b'I',
            TransactionState::Transaction => b'T',
            TransactionState::Error => b'E',
        }
    }
}

/// A single field in a RowDescription (PostgreSQL wire protocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptionField {
    pub name: String,
    pub type_oid: i32,
}

impl RowDescriptionField {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: TEXT_OID,
        }
    }
}

/// One `code value` pair of an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeField {
    pub code: u8,
    pub value: String,
}

impl NoticeField {
    pub fn new(code: u8, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    ParameterStatus { key: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { state: TransactionState },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    EmptyQueryResponse,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<i32> },
    RowDescription { fields: Vec<RowDescriptionField> },
    DataRow { values: Vec<Option<Vec<u8>>> },
    CommandComplete { tag: String },
    ErrorResponse(ErrorReport),
    NoticeResponse { fields: Vec<NoticeField> },
    NotificationResponse { pid: i32, channel: String, payload: String },
    CopyInResponse { format: i8, column_formats: Vec<i16> },
    CopyOutResponse { format: i8, column_formats: Vec<i16> },
    CopyBothResponse { format: i8, column_formats: Vec<i16> },
    CopyData { data: Vec<u8> },
    CopyDone,
    FunctionCallResponse { result: Option<Vec<u8>> },
}
