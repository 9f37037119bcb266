/// SQLSTATE codes this server reports. See
/// https://www.postgresql.org/docs/current/errcodes-appendix.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlState {
    FeatureNotSupported,
    ProtocolViolation,
    InvalidAuthorizationSpecification,
    InvalidPassword,
    InvalidCatalogName,
    TooManyConnections,
    InvalidSqlStatementName,
    InvalidCursorName,
    DuplicatePreparedStatement,
    DuplicateCursor,
    InvalidBinaryRepresentation,
    SyntaxError,
}

impl SqlState {
    pub fn code(self) -> &'static str {
        match self {
            SqlState::FeatureNotSupported => "0A000",
            SqlState::ProtocolViolation => "08P01",
            SqlState::InvalidAuthorizationSpecification => "28000",
            SqlState::InvalidPassword => "28P01",
            SqlState::InvalidCatalogName => "3D000",
            SqlState::TooManyConnections => "53300",
            SqlState::InvalidSqlStatementName => "26000",
            SqlState::InvalidCursorName => "34000",
            SqlState::DuplicatePreparedStatement => "42P05",
            SqlState::DuplicateCursor => "42P03",
            SqlState::InvalidBinaryRepresentation => "22P03",
            SqlState::SyntaxError => "42601",
        }
    }
}
