use crate::binder::{bind, is_multi_statement, parameter_literal};
use crate::registry::ProcessTable;
use crate::session::{BindRequest, FrontendHandler, Replies, StartupReply};
use crate::store::{StatementStore, StoreError, UNNAMED};
use async_trait::async_trait;
use pgsession_core::{
    CommandError, CommandResult, DataBackend, ErrorReport, QueryResult, SessionError, SqlState,
};
use pgsession_protocol::{
    BackendMessage, CloseTarget, DescribeTarget, FormatCode, RowDescriptionField,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Values reported to clients at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub server_version: String,
    pub parameter_status: BTreeMap<String, String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_version: "9.4".to_string(),
            parameter_status: BTreeMap::new(),
        }
    }
}

/// Simple and extended query protocol over a `DataBackend`.
pub struct QueryProtocol<B> {
    backend: B,
    store: StatementStore,
    processes: Arc<ProcessTable>,
    settings: Arc<SessionSettings>,
    user: String,
    database: String,
}

impl<B: DataBackend> QueryProtocol<B> {
    pub fn new(backend: B, processes: Arc<ProcessTable>, settings: Arc<SessionSettings>) -> Self {
        Self {
            backend,
            store: StatementStore::new(),
            processes,
            settings,
            user: String::new(),
            database: String::new(),
        }
    }

    pub fn store(&self) -> &StatementStore {
        &self.store
    }

    async fn finish_login(&mut self, out: &mut Replies) -> CommandResult<()> {
        if !self.backend.set_database(&self.database).await {
            return Err(ErrorReport::fatal(
                SqlState::InvalidCatalogName,
                format!("database \"{}\" does not exist", self.database),
            )
            .into());
        }
        out.authentication_ok().await?;
        out.backend_key_data().await?;
        let client_encoding = out.charset().name();
        out.parameter_status("server_version", &self.settings.server_version)
            .await?;
        out.parameter_status("server_encoding", "UTF8").await?;
        out.parameter_status("client_encoding", client_encoding)
            .await?;
        for (key, value) in &self.settings.parameter_status {
            out.parameter_status(key, value).await?;
        }
        debug!(pid = out.pid(), user = %self.user, database = %self.database, "login complete");
        Ok(())
    }

    async fn simple_query(&mut self, out: &mut Replies, sql: &str) -> CommandResult<()> {
        // simple and extended queries share the unnamed slots
        self.store.remove_statement_cascade(UNNAMED);
        self.store.remove_portal(UNNAMED);

        let sql = sql.trim();
        if is_empty_query(sql) {
            out.send(&BackendMessage::EmptyQueryResponse).await?;
            return Ok(());
        }
        if is_multi_statement(sql) {
            return Err(ErrorReport::unsupported("more than one statement per query").into());
        }
        let mut result = self.backend.get_result(sql).await;
        send_result(out, &mut result, 0, true).await
    }
}

#[async_trait]
impl<B: DataBackend> FrontendHandler for QueryProtocol<B> {
    async fn startup(
        &mut self,
        out: &mut Replies,
        params: HashMap<String, String>,
    ) -> CommandResult<StartupReply> {
        let Some(user) = params.get("user") else {
            return Err(ErrorReport::fatal(
                SqlState::InvalidAuthorizationSpecification,
                "no PostgreSQL user name specified in startup packet",
            )
            .into());
        };
        self.user = user.clone();
        self.database = params.get("database").unwrap_or(user).clone();

        if self.backend.set_user(&self.user).await {
            self.finish_login(out).await?;
            Ok(StartupReply::Done)
        } else {
            out.authentication_cleartext_password().await?;
            Ok(StartupReply::NeedsPassword)
        }
    }

    async fn password(&mut self, out: &mut Replies, password: String) -> CommandResult<()> {
        if !self.backend.set_password(&password).await {
            return Err(ErrorReport::fatal(
                SqlState::InvalidPassword,
                format!("password authentication failed for user \"{}\"", self.user),
            )
            .into());
        }
        self.finish_login(out).await
    }

    async fn cancel_request(&mut self, process_id: i32, secret_key: i32) {
        self.processes.cancel(process_id, secret_key);
    }

    async fn query(&mut self, out: &mut Replies, sql: String) -> CommandResult<()> {
        match self.simple_query(out, &sql).await {
            Ok(()) => {}
            Err(CommandError::Client(report)) => out.error(&report).await?,
            Err(err) => return Err(err),
        }
        out.ready_for_query().await?;
        Ok(())
    }

    async fn parse(
        &mut self,
        out: &mut Replies,
        statement_name: String,
        query: String,
        _param_oids: Vec<i32>,
    ) -> CommandResult<()> {
        self.store
            .put_statement(&statement_name, query)
            .map_err(store_error)?;
        out.send(&BackendMessage::ParseComplete).await?;
        Ok(())
    }

    async fn bind(&mut self, out: &mut Replies, request: BindRequest) -> CommandResult<()> {
        let Some(sql) = self.store.get_statement_sql(&request.statement_name) else {
            return Err(ErrorReport::error(
                SqlState::InvalidSqlStatementName,
                format!(
                    "prepared statement \"{}\" does not exist",
                    request.statement_name
                ),
            )
            .into());
        };
        if request.result_formats.contains(&FormatCode::Binary) {
            return Err(ErrorReport::unsupported("binary result format").into());
        }
        let charset = out.charset();
        let literals = request
            .params
            .iter()
            .map(|(format, value)| parameter_literal(*format, value.as_deref(), charset))
            .collect::<Result<Vec<_>, _>>()?;
        let bound = bind(sql, &literals)?;

        if request.portal_name == UNNAMED {
            self.store.remove_portal(UNNAMED);
        }
        self.store
            .put_portal(&request.statement_name, &request.portal_name, bound)
            .map_err(store_error)?;
        out.send(&BackendMessage::BindComplete).await?;
        Ok(())
    }

    async fn describe(
        &mut self,
        out: &mut Replies,
        target: DescribeTarget,
        name: String,
    ) -> CommandResult<()> {
        if target == DescribeTarget::Statement {
            return Err(ErrorReport::unsupported("describing a prepared statement").into());
        }
        let portal = self
            .store
            .get_portal_mut(&name)
            .ok_or_else(|| unknown_portal(&name))?;
        let msg = match portal.result(&mut self.backend).await.header() {
            Some(header) => row_description(header),
            None => BackendMessage::NoData,
        };
        out.send(&msg).await?;
        Ok(())
    }

    async fn execute(
        &mut self,
        out: &mut Replies,
        portal_name: String,
        max_rows: i32,
    ) -> CommandResult<()> {
        let portal = self
            .store
            .get_portal_mut(&portal_name)
            .ok_or_else(|| unknown_portal(&portal_name))?;
        if is_empty_query(portal.sql().trim()) {
            out.send(&BackendMessage::EmptyQueryResponse).await?;
            return Ok(());
        }
        let limit = usize::try_from(max_rows).unwrap_or(0);
        let result = portal.result(&mut self.backend).await;
        send_result(out, result, limit, false).await
    }

    async fn close(
        &mut self,
        out: &mut Replies,
        target: CloseTarget,
        name: String,
    ) -> CommandResult<()> {
        match target {
            CloseTarget::Statement => self.store.remove_statement_cascade(&name),
            CloseTarget::Portal => self.store.remove_portal(&name),
        };
        out.send(&BackendMessage::CloseComplete).await?;
        Ok(())
    }

    async fn sync(&mut self, out: &mut Replies) -> CommandResult<()> {
        out.ready_for_query().await?;
        Ok(())
    }

    async fn terminate(&mut self) {
        debug!(user = %self.user, "client terminated");
    }
}

fn is_empty_query(sql: &str) -> bool {
    sql.is_empty() || sql == ";"
}

fn unknown_portal(name: &str) -> CommandError {
    ErrorReport::error(
        SqlState::InvalidCursorName,
        format!("portal \"{name}\" does not exist"),
    )
    .into()
}

fn store_error(err: StoreError) -> CommandError {
    match err {
        StoreError::StatementExists(_) => {
            ErrorReport::error(SqlState::DuplicatePreparedStatement, err.to_string()).into()
        }
        StoreError::PortalExists(_) => {
            ErrorReport::error(SqlState::DuplicateCursor, err.to_string()).into()
        }
        StoreError::UnknownStatement(_) => SessionError::protocol(err.to_string()).into(),
    }
}

fn row_description(header: &[String]) -> BackendMessage {
    BackendMessage::RowDescription {
        fields: header.iter().map(RowDescriptionField::text).collect(),
    }
}

/// Streams one result. `max_rows` of 0 means no limit; a SELECT cut short by
/// the limit ends with PortalSuspended and resumes on the next Execute.
async fn send_result(
    out: &mut Replies,
    result: &mut QueryResult,
    max_rows: usize,
    describe: bool,
) -> CommandResult<()> {
    let charset = out.charset();
    match result {
        QueryResult::Select { header, rows } => {
            if describe {
                out.send(&row_description(header)).await?;
            }
            let mut sent = 0usize;
            loop {
                if max_rows > 0 && sent == max_rows && rows.has_more() {
                    out.send(&BackendMessage::PortalSuspended).await?;
                    return Ok(());
                }
                let Some(row) = rows.next_row() else {
                    break;
                };
                let values = row
                    .iter()
                    .map(|cell| cell.as_deref().map(|text| charset.encode(text).into_owned()))
                    .collect();
                out.send(&BackendMessage::DataRow { values }).await?;
                sent += 1;
            }
            out.send(&BackendMessage::CommandComplete {
                tag: format!("SELECT {sent}"),
            })
            .await?;
            Ok(())
        }
        QueryResult::Error { message } => {
            Err(ErrorReport::error(SqlState::SyntaxError, message.clone()).into())
        }
        other => {
            if let Some(tag) = other.command_tag() {
                out.send(&BackendMessage::CommandComplete { tag }).await?;
            }
            Ok(())
        }
    }
}
