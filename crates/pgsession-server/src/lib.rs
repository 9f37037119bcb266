pub mod auth;
pub mod binder;
pub mod config;
pub mod query;
pub mod registry;
pub mod scripted;
pub mod server;
pub mod session;
pub mod store;

pub use query::{QueryProtocol, SessionSettings};
pub use registry::{ProcessSlot, ProcessTable};
pub use server::{handle_connection, Server, ServerOptions};
pub use session::{
    BindRequest, FrontendHandler, Replies, Session, SessionOutcome, StartupReply,
};
pub use store::{Portal, StatementStore, StoreError};

#[cfg(test)]
mod tests;
