pub mod backend;
pub mod charset;
pub mod error;
pub mod sqlstate;
pub mod types;

pub use backend::DataBackend;
pub use charset::Charset;
pub use error::{
    CommandError, CommandResult, ErrorReport, SessionError, SessionResult, Severity,
};
pub use sqlstate::SqlState;
pub use types::{Cell, QueryResult, ResultKind, Row, RowStream};
