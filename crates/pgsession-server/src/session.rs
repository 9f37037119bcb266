use async_trait::async_trait;
use metrics::counter;
use pgsession_core::{
    Charset, CommandError, CommandResult, ErrorReport, SessionError, SessionResult, SqlState,
};
use pgsession_protocol::{
    expand_format_codes, read_message, read_password, read_startup, BackendMessage, BackendWriter,
    CloseTarget, DescribeTarget, FormatCode, FramedReader, FrontendMessage, StartupRequest,
    TransactionState,
};
use crate::registry::{ProcessSlot, ProcessTable};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// How `Session::run` ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client sent Terminate.
    Terminated,
    /// Startup or authentication did not complete. Cancel requests end here.
    NotAuthenticated,
    /// The transport closed after login without a Terminate.
    Closed,
}

/// What the startup handler wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupReply {
    Done,
    NeedsPassword,
}

/// A Bind with its format codes expanded to one per parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub portal_name: String,
    pub statement_name: String,
    pub params: Vec<(FormatCode, Option<Vec<u8>>)>,
    pub result_formats: Vec<FormatCode>,
}

pub type ReplyStream = Box<dyn AsyncWrite + Send + Unpin>;

/// The backend half of a session, shared by every handler implementation.
pub struct Replies {
    writer: BackendWriter<ReplyStream>,
    pid: i32,
    secret_key: i32,
    charset: Charset,
    authenticated: bool,
}

impl Replies {
    /// The pid and secret key stay 0 until the session is admitted.
    pub fn new(stream: ReplyStream) -> Self {
        Self {
            writer: BackendWriter::new(stream),
            pid: 0,
            secret_key: 0,
            charset: Charset::default(),
            authenticated: false,
        }
    }

    /// A reply the client does not take within `limit` ends the session.
    pub fn with_write_timeout(self, limit: Option<Duration>) -> Self {
        Self {
            writer: self.writer.with_write_timeout(limit),
            ..self
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Applies to DataRow cells and to every string field written afterwards.
    pub fn set_charset(&mut self, charset: Charset) {
        self.charset = charset;
        self.writer.set_charset(charset);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub async fn send(&mut self, msg: &BackendMessage) -> SessionResult<()> {
        self.writer.write_message(msg).await
    }

    /// The session counts as logged in once this has been sent.
    pub async fn authentication_ok(&mut self) -> SessionResult<()> {
        self.send(&BackendMessage::AuthenticationOk).await?;
        self.authenticated = true;
        Ok(())
    }

    pub async fn authentication_cleartext_password(&mut self) -> SessionResult<()> {
        self.send(&BackendMessage::AuthenticationCleartextPassword)
            .await
    }

    pub async fn backend_key_data(&mut self) -> SessionResult<()> {
        let msg = BackendMessage::BackendKeyData {
            pid: self.pid,
            secret: self.secret_key,
        };
        self.send(&msg).await
    }

    pub async fn parameter_status(&mut self, key: &str, value: &str) -> SessionResult<()> {
        self.send(&BackendMessage::ParameterStatus {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// No transaction blocks are modelled, so the state is always idle.
    pub async fn ready_for_query(&mut self) -> SessionResult<()> {
        self.send(&BackendMessage::ReadyForQuery {
            state: TransactionState::Idle,
        })
        .await
    }

    pub async fn error(&mut self, report: &ErrorReport) -> SessionResult<()> {
        counter!("pgsession_query_errors_total").increment(1);
        self.send(&BackendMessage::ErrorResponse(report.clone()))
            .await
    }

    pub async fn flush(&mut self) -> SessionResult<()> {
        self.writer.flush().await
    }

    async fn refuse_encryption(&mut self) -> SessionResult<()> {
        self.writer.write_raw_byte(b'N').await
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(pid = self.pid, "shutdown after session end failed: {err}");
        }
    }
}

/// Callbacks for the frontend messages of one session.
///
/// Returning `CommandError::Client` sends the report as an ErrorResponse and
/// keeps the session; `CommandError::Session` ends it.
#[async_trait]
pub trait FrontendHandler: Send {
    async fn startup(
        &mut self,
        out: &mut Replies,
        params: HashMap<String, String>,
    ) -> CommandResult<StartupReply>;

    async fn password(&mut self, out: &mut Replies, password: String) -> CommandResult<()>;

    async fn cancel_request(&mut self, process_id: i32, secret_key: i32);

    async fn query(&mut self, out: &mut Replies, sql: String) -> CommandResult<()>;

    async fn parse(
        &mut self,
        out: &mut Replies,
        statement_name: String,
        query: String,
        param_oids: Vec<i32>,
    ) -> CommandResult<()>;

    async fn bind(&mut self, out: &mut Replies, request: BindRequest) -> CommandResult<()>;

    async fn describe(
        &mut self,
        out: &mut Replies,
        target: DescribeTarget,
        name: String,
    ) -> CommandResult<()>;

    async fn execute(
        &mut self,
        out: &mut Replies,
        portal_name: String,
        max_rows: i32,
    ) -> CommandResult<()>;

    async fn close(&mut self, out: &mut Replies, target: CloseTarget, name: String)
        -> CommandResult<()>;

    async fn sync(&mut self, out: &mut Replies) -> CommandResult<()>;

    async fn flush(&mut self, out: &mut Replies) -> CommandResult<()> {
        out.flush().await?;
        Ok(())
    }

    async fn function_call(&mut self, _out: &mut Replies, _object_id: i32) -> CommandResult<()> {
        Err(ErrorReport::unsupported("the function call sub-protocol").into())
    }

    async fn copy_data(&mut self, _out: &mut Replies, _data: Vec<u8>) -> CommandResult<()> {
        Err(ErrorReport::unsupported("COPY").into())
    }

    async fn copy_done(&mut self, _out: &mut Replies) -> CommandResult<()> {
        Err(ErrorReport::unsupported("COPY").into())
    }

    async fn copy_fail(&mut self, _out: &mut Replies, _message: String) -> CommandResult<()> {
        Err(ErrorReport::unsupported("COPY").into())
    }

    async fn terminate(&mut self) {}
}

enum Step {
    Continue,
    Terminate,
}

/// Drives one connection: startup, admission, authentication, then the
/// command loop.
///
/// A matching cancel request ends the session wherever it is, including a
/// blocked write or a backend call that never returns.
pub struct Session<R, H> {
    reader: FramedReader<R>,
    out: Replies,
    handler: H,
    processes: Arc<ProcessTable>,
    max_connections: usize,
    slot: Option<ProcessSlot>,
}

impl<R, H> Session<R, H>
where
    R: AsyncRead + Unpin + Send,
    H: FrontendHandler,
{
    /// `max_connections` of 0 admits every client.
    pub fn new(
        reader: FramedReader<R>,
        mut out: Replies,
        handler: H,
        processes: Arc<ProcessTable>,
        max_connections: usize,
    ) -> Self {
        out.set_charset(reader.charset());
        Self {
            reader,
            out,
            handler,
            processes,
            max_connections,
            slot: None,
        }
    }

    pub async fn run(mut self) -> SessionResult<SessionOutcome> {
        let kill = self.reader.kill_signal();
        let result = tokio::select! {
            biased;
            _ = kill.cancelled() => Err(SessionError::Killed),
            result = self.run_inner() => result,
        };
        // a killed session may be stuck behind a peer that stopped reading
        if !matches!(result, Err(SessionError::Killed)) {
            self.out.shutdown().await;
        }
        if let Some(slot) = self.slot.take() {
            debug!(pid = slot.pid(), "process slot released");
        }
        match result {
            Err(err) if err.is_transport() => {
                debug!(pid = self.out.pid, "transport closed: {err}");
                if self.out.is_authenticated() {
                    Ok(SessionOutcome::Closed)
                } else {
                    Ok(SessionOutcome::NotAuthenticated)
                }
            }
            other => other,
        }
    }

    async fn run_inner(&mut self) -> SessionResult<SessionOutcome> {
        let params = loop {
            match read_startup(self.reader.raw_mut()).await {
                Ok(StartupRequest::SslRequest) | Ok(StartupRequest::GssEncRequest) => {
                    self.out.refuse_encryption().await?;
                }
                Ok(StartupRequest::CancelRequest {
                    process_id,
                    secret_key,
                }) => {
                    self.handler.cancel_request(process_id, secret_key).await;
                    return Ok(SessionOutcome::NotAuthenticated);
                }
                Ok(StartupRequest::Startup { params, .. }) => break params,
                Err(SessionError::UnrecognizedVersion(version)) => {
                    let report = ErrorReport::fatal(
                        SqlState::ProtocolViolation,
                        format!("Unrecognized protocol version {version}"),
                    );
                    self.out.error(&report).await?;
                    return Err(SessionError::UnrecognizedVersion(version));
                }
                Err(err) => return Err(err),
            }
        };

        if let Some(charset) = params
            .get("client_encoding")
            .and_then(|name| Charset::from_name(name))
        {
            self.reader.raw_mut().set_charset(charset);
            self.out.set_charset(charset);
        }

        self.admit().await?;

        if !self.authenticate(params).await? {
            debug!(pid = self.out.pid, "session ends before login");
            return Ok(SessionOutcome::NotAuthenticated);
        }

        self.out.ready_for_query().await?;
        loop {
            let msg = read_message(&mut self.reader).await?;
            self.reader.check_exhausted()?;
            let tag = msg.tag();
            counter!("pgsession_commands_total", "tag" => (tag as char).to_string())
                .increment(1);
            match self.dispatch(msg).await {
                Ok(Step::Continue) => {}
                Ok(Step::Terminate) => return Ok(SessionOutcome::Terminated),
                Err(CommandError::Client(report)) => {
                    debug!(pid = self.out.pid, tag = %(tag as char), "{report}");
                    self.out.error(&report).await?;
                }
                Err(CommandError::Session(err)) => return Err(err),
            }
        }
    }

    /// Takes a process slot for a client that sent a real startup packet.
    /// Cancel and encryption requests never get here, so they neither count
    /// against the limit nor use up a pid.
    async fn admit(&mut self) -> SessionResult<()> {
        let kill = self.reader.kill_signal();
        let Some(slot) = self.processes.try_allocate(self.max_connections, kill) else {
            let report = ErrorReport::fatal(
                SqlState::TooManyConnections,
                "sorry, too many clients already",
            );
            self.out.send(&BackendMessage::ErrorResponse(report)).await?;
            return Err(SessionError::Rejected(format!(
                "too many connections (limit {})",
                self.max_connections
            )));
        };
        self.out.pid = slot.pid();
        self.out.secret_key = slot.secret_key();
        counter!("pgsession_sessions_total").increment(1);
        info!(pid = slot.pid(), "session started");
        self.slot = Some(slot);
        Ok(())
    }

    /// Returns whether the client ended up authenticated. Client errors here
    /// are reported and end the login.
    async fn authenticate(&mut self, params: HashMap<String, String>) -> SessionResult<bool> {
        let reply = match self.handler.startup(&mut self.out, params).await {
            Ok(reply) => reply,
            Err(err) => return self.login_failed(err).await,
        };
        if reply == StartupReply::NeedsPassword && !self.out.is_authenticated() {
            let password = read_password(self.reader.raw_mut()).await?;
            if let Err(err) = self.handler.password(&mut self.out, password).await {
                return self.login_failed(err).await;
            }
        }
        Ok(self.out.is_authenticated())
    }

    async fn login_failed(&mut self, err: CommandError) -> SessionResult<bool> {
        match err {
            CommandError::Client(report) => {
                warn!(pid = self.out.pid, "login rejected: {report}");
                self.out.error(&report).await?;
                Ok(false)
            }
            CommandError::Session(err) => Err(err),
        }
    }

    async fn dispatch(&mut self, msg: FrontendMessage) -> CommandResult<Step> {
        let out = &mut self.out;
        let handler = &mut self.handler;
        match msg {
            FrontendMessage::Query { sql } => handler.query(out, sql).await?,
            FrontendMessage::Parse {
                statement_name,
                query,
                param_oids,
            } => {
                handler
                    .parse(out, statement_name, query, param_oids)
                    .await?
            }
            FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_format_codes,
                param_values,
                result_format_codes,
            } => {
                let formats = expand_format_codes(&param_format_codes, param_values.len())?;
                let result_formats =
                    expand_format_codes(&result_format_codes, result_format_codes.len())?;
                let request = BindRequest {
                    portal_name,
                    statement_name,
                    params: formats.into_iter().zip(param_values).collect(),
                    result_formats,
                };
                handler.bind(out, request).await?
            }
            FrontendMessage::Describe { target, name } => {
                handler.describe(out, target, name).await?
            }
            FrontendMessage::Execute {
                portal_name,
                max_rows,
            } => handler.execute(out, portal_name, max_rows).await?,
            FrontendMessage::Close { target, name } => handler.close(out, target, name).await?,
            FrontendMessage::Flush => handler.flush(out).await?,
            FrontendMessage::Sync => handler.sync(out).await?,
            FrontendMessage::FunctionCall { object_id, .. } => {
                handler.function_call(out, object_id).await?
            }
            FrontendMessage::CopyData { data } => handler.copy_data(out, data).await?,
            FrontendMessage::CopyDone => handler.copy_done(out).await?,
            FrontendMessage::CopyFail { message } => handler.copy_fail(out, message).await?,
            FrontendMessage::Terminate => {
                handler.terminate().await;
                return Ok(Step::Terminate);
            }
        }
        Ok(Step::Continue)
    }
}
