use std::fmt;

/// One result cell in text form; `None` is SQL NULL.
pub type Cell = Option<String>;
pub type Row = Vec<Cell>;

/// Single-pass, forward-only row sequence produced by a backend.
///
/// Rows are pulled lazily; the stream is never restarted. `pulled` counts
/// every row handed out so far, across all callers.
pub struct RowStream {
    rows: Box<dyn Iterator<Item = Row> + Send>,
    lookahead: Option<Row>,
    pulled: u64,
    exhausted: bool,
}

impl RowStream {
    pub fn new<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send + 'static,
    {
        Self {
            rows: Box::new(rows.into_iter()),
            lookahead: None,
            pulled: 0,
            exhausted: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn next_row(&mut self) -> Option<Row> {
        let row = self.lookahead.take().or_else(|| self.advance())?;
        self.pulled += 1;
        Some(row)
    }

    /// Whether another row is pending. May pull one row ahead from the
    /// backend and hold it for the next `next_row`.
    pub fn has_more(&mut self) -> bool {
        if self.lookahead.is_none() {
            self.lookahead = self.advance();
        }
        self.lookahead.is_some()
    }

    fn advance(&mut self) -> Option<Row> {
        if self.exhausted {
            return None;
        }
        let row = self.rows.next();
        if row.is_none() {
            self.exhausted = true;
        }
        row
    }

    pub fn pulled(&self) -> u64 {
        self.pulled
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.lookahead.is_none()
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("pulled", &self.pulled)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Create,
    Delete,
    Insert,
    Update,
    Select,
    Error,
}

/// What a backend returns for one SQL text. Failures are values, never
/// panics or `Err`s: the `Error` variant carries the message for the client.
#[derive(Debug)]
pub enum QueryResult {
    Create { rows: u64 },
    Delete { rows: u64 },
    Insert { rows: u64 },
    Update { rows: u64 },
    Select { header: Vec<String>, rows: RowStream },
    Error { message: String },
}

impl QueryResult {
    pub fn select<I>(header: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send + 'static,
    {
        QueryResult::Select {
            header,
            rows: RowStream::new(rows),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        QueryResult::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            QueryResult::Create { .. } => ResultKind::Create,
            QueryResult::Delete { .. } => ResultKind::Delete,
            QueryResult::Insert { .. } => ResultKind::Insert,
            QueryResult::Update { .. } => ResultKind::Update,
            QueryResult::Select { .. } => ResultKind::Select,
            QueryResult::Error { .. } => ResultKind::Error,
        }
    }

    /// Column names for row-shaped results.
    pub fn header(&self) -> Option<&[String]> {
        match self {
            QueryResult::Select { header, .. } => Some(header),
            _ => None,
        }
    }

    /// CommandComplete tag for the row-count kinds. `Select` is tagged by the
    /// caller with the number of rows it delivered; `Error` has no tag.
    pub fn command_tag(&self) -> Option<String> {
        match self {
            // CREATE TABLE AS reports the rows it selected.
            QueryResult::Create { rows } => Some(format!("SELECT {rows}")),
            QueryResult::Delete { rows } => Some(format!("DELETE {rows}")),
            QueryResult::Insert { rows } => Some(format!("INSERT 0 {rows}")),
            QueryResult::Update { rows } => Some(format!("UPDATE {rows}")),
            QueryResult::Select { .. } | QueryResult::Error { .. } => None,
        }
    }
}
