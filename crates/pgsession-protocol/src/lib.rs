pub mod backend;
pub mod frontend;
pub mod messages;
pub mod reader;
pub mod writer;

pub use frontend::{read_message, read_password, read_startup};
pub use messages::{
    expand_format_codes, BackendMessage, CloseTarget, DescribeTarget, FormatCode,
    FrontendMessage, NoticeField, RowDescriptionField, StartupRequest, TransactionState,
};
pub use reader::{FramedReader, RawReader};
pub use writer::{BackendWriter, MessageBuilder};
