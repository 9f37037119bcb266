use crate::types::QueryResult;
use async_trait::async_trait;

/// The query-execution collaborator driven by a session.
///
/// One instance serves one session, so implementations may keep per-session
/// state (current user, database) without locking.
#[async_trait]
pub trait DataBackend: Send + 'static {
    /// Returns true when the user may log in without a password.
    async fn set_user(&mut self, name: &str) -> bool;

    /// Returns true when the database exists and the user may use it.
    async fn set_database(&mut self, name: &str) -> bool;

    /// Returns true when the password authenticates the current user.
    async fn set_password(&mut self, password: &str) -> bool;

    /// Runs one SQL text. Must not fail: errors are `QueryResult::Error`.
    async fn get_result(&mut self, sql: &str) -> QueryResult;
}
