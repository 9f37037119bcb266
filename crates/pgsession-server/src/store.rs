use pgsession_core::{DataBackend, QueryResult};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// The name of the unnamed statement and of the unnamed portal.
pub const UNNAMED: &str = "";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("prepared statement \"{0}\" already exists")]
    StatementExists(String),
    #[error("portal \"{0}\" already exists")]
    PortalExists(String),
    #[error("portal bound to unknown statement \"{0}\"")]
    UnknownStatement(String),
}

#[derive(Debug)]
struct Statement {
    sql: String,
    portals: HashSet<String>,
}

/// A statement bound to concrete parameters. The SQL is fixed at bind time;
/// the result is produced on first use and never recomputed.
#[derive(Debug)]
pub struct Portal {
    statement: String,
    sql: String,
    result: Option<QueryResult>,
}

impl Portal {
    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn cached_result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }

    /// Runs the SQL on first use; later calls return the cached result,
    /// including a partly consumed row stream.
    pub async fn result<B: DataBackend>(&mut self, backend: &mut B) -> &mut QueryResult {
        let result = match self.result.take() {
            Some(cached) => cached,
            None => backend.get_result(&self.sql).await,
        };
        self.result.insert(result)
    }
}

/// Per-session prepared statements and portals.
///
/// Two independent namespaces. Every portal names its statement and every
/// statement lists its portals, so removing a statement removes its portals.
#[derive(Debug, Default)]
pub struct StatementStore {
    statements: HashMap<String, Statement>,
    portals: HashMap<String, Portal>,
}

impl StatementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unnamed slot is always replaced, together with its portals.
    pub fn put_statement(&mut self, name: &str, sql: impl Into<String>) -> Result<(), StoreError> {
        if name == UNNAMED {
            self.remove_statement_cascade(UNNAMED);
        } else if self.statements.contains_key(name) {
            return Err(StoreError::StatementExists(name.to_string()));
        }
        self.statements.insert(
            name.to_string(),
            Statement {
                sql: sql.into(),
                portals: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Callers resolve the statement before binding, so `UnknownStatement`
    /// signals a bug rather than a client mistake.
    pub fn put_portal(
        &mut self,
        statement: &str,
        portal: &str,
        sql: impl Into<String>,
    ) -> Result<(), StoreError> {
        if self.portals.contains_key(portal) {
            return Err(StoreError::PortalExists(portal.to_string()));
        }
        let owner = self
            .statements
            .get_mut(statement)
            .ok_or_else(|| StoreError::UnknownStatement(statement.to_string()))?;
        owner.portals.insert(portal.to_string());
        self.portals.insert(
            portal.to_string(),
            Portal {
                statement: statement.to_string(),
                sql: sql.into(),
                result: None,
            },
        );
        Ok(())
    }

    /// Returns false when there was nothing to remove.
    pub fn remove_statement_cascade(&mut self, name: &str) -> bool {
        let Some(statement) = self.statements.remove(name) else {
            return false;
        };
        for portal in &statement.portals {
            self.portals.remove(portal);
        }
        true
    }

    pub fn remove_portal(&mut self, name: &str) -> bool {
        let Some(portal) = self.portals.remove(name) else {
            return false;
        };
        if let Some(owner) = self.statements.get_mut(&portal.statement) {
            owner.portals.remove(name);
        }
        true
    }

    pub fn get_statement_sql(&self, name: &str) -> Option<&str> {
        self.statements.get(name).map(|s| s.sql.as_str())
    }

    pub fn get_portal(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    pub fn get_portal_mut(&mut self, name: &str) -> Option<&mut Portal> {
        self.portals.get_mut(name)
    }

    /// Portal names owned by a statement, sorted.
    pub fn portals_of(&self, statement: &str) -> Option<Vec<&str>> {
        let owner = self.statements.get(statement)?;
        let mut names: Vec<&str> = owner.portals.iter().map(String::as_str).collect();
        names.sort_unstable();
        Some(names)
    }
}
