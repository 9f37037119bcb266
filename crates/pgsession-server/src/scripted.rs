use crate::auth::AuthManager;
use crate::config::{QueryConfig, QueryKind};
use async_trait::async_trait;
use pgsession_core::{DataBackend, QueryResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Canned answers keyed by normalised SQL text.
#[derive(Debug, Default)]
pub struct Script {
    queries: HashMap<String, QueryConfig>,
}

impl Script {
    pub fn new(queries: &[QueryConfig]) -> Self {
        Self {
            queries: queries
                .iter()
                .map(|q| (normalize(&q.sql), q.clone()))
                .collect(),
        }
    }

    fn answer(&self, sql: &str) -> QueryResult {
        let Some(query) = self.queries.get(&normalize(sql)) else {
            return QueryResult::error(format!("no scripted result for: {sql}"));
        };
        match query.kind {
            QueryKind::Select => {
                let rows: Vec<_> = query
                    .rows
                    .iter()
                    .map(|row| row.iter().cloned().map(Some).collect())
                    .collect();
                QueryResult::select(query.columns.clone(), rows)
            }
            QueryKind::Insert => QueryResult::Insert {
                rows: query.rows_affected,
            },
            QueryKind::Update => QueryResult::Update {
                rows: query.rows_affected,
            },
            QueryKind::Delete => QueryResult::Delete {
                rows: query.rows_affected,
            },
            QueryKind::Create => QueryResult::Create {
                rows: query.rows_affected,
            },
            QueryKind::Error => QueryResult::error(query.message.clone().unwrap_or_default()),
        }
    }
}

/// Case, runs of whitespace and a trailing semicolon do not matter.
fn normalize(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A `DataBackend` answering from configuration, used by the server binary.
pub struct ScriptedBackend {
    auth: Arc<AuthManager>,
    script: Arc<Script>,
    user: Option<String>,
}

impl ScriptedBackend {
    pub fn new(auth: Arc<AuthManager>, script: Arc<Script>) -> Self {
        Self {
            auth,
            script,
            user: None,
        }
    }
}

#[async_trait]
impl DataBackend for ScriptedBackend {
    async fn set_user(&mut self, name: &str) -> bool {
        self.user = Some(name.to_string());
        self.auth.requires_password(name) == Some(false)
    }

    async fn set_database(&mut self, name: &str) -> bool {
        self.auth.database_allowed(name)
    }

    async fn set_password(&mut self, password: &str) -> bool {
        match &self.user {
            Some(user) => self.auth.authenticate(user, password).is_ok(),
            None => false,
        }
    }

    async fn get_result(&mut self, sql: &str) -> QueryResult {
        self.script.answer(sql)
    }
}
