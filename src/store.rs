use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::HistoryError;

pub fn init_store(conn: &Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
",
    )?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

    // Override the built-in GLOB so patterns gain a backslash escape for
    // literal wildcard characters. SQLite calls glob(pattern, text) for
    // every `x GLOB ?` expression once this is registered.
    conn.create_scalar_function(
        "glob",
        2,
        rusqlite::functions::FunctionFlags::SQLITE_UTF8
            | rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern = ctx.get::<String>(0)?;
            let text = ctx.get::<String>(1).unwrap_or_default();
            let re = glob_to_regex(&pattern)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(re.is_match(&text))
        },
    )?;

    conn.execute_batch(
        "
        -- Sessions: one per interactive run
        CREATE TABLE IF NOT EXISTS sessions (
            session     integer primary key autoincrement,
            start       timestamp,
            end         timestamp,
            num_cmds    integer,
            remark      text
        );

        -- Input lines, keyed by (session, line)
        CREATE TABLE IF NOT EXISTS history (
            session     integer,
            line        integer,
            source      text,
            source_raw  text,
            PRIMARY KEY (session, line)
        );

        -- Output records are optional, but keep the table around so logging
        -- can be enabled later
        CREATE TABLE IF NOT EXISTS output_history (
            session     integer,
            line        integer,
            output      text,
            PRIMARY KEY (session, line)
        );
    ",
    )?;

    Ok(())
}

/// Translate a glob pattern into an anchored regex: `*` and `?` are
/// wildcards, a backslash escapes the next character, everything else
/// matches literally. `*` crosses newlines, as multi-line sources are
/// stored verbatim.
fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push_str("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => push_literal(&mut translated, escaped),
                None => translated.push_str(r"\\"),
            },
            other => push_literal(&mut translated, other),
        }
    }
    translated.push('$');
    regex::Regex::new(&translated)
}

fn push_literal(dst: &mut String, c: char) {
    if r".^$*+?()[]{}|\".contains(c) {
        dst.push('\\');
    }
    dst.push(c);
}

/// SQLite-backed storage for sessions and their input/output lines.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| HistoryError::io(dir, e))?;
        }
        let conn = Connection::open(path)?;
        init_store(&conn, busy_timeout_ms)?;
        Ok(Self { conn })
    }

    /// Ephemeral store for tests and short-lived embedders.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        init_store(&conn, 10000)?;
        Ok(Self { conn })
    }

    // ── Session management ─────────────────────────────────────────

    pub fn open_session(&self) -> rusqlite::Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO sessions VALUES (NULL, ?, NULL, NULL, '')",
            params![now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn close_session(&self, session: i64, num_cmds: i64) -> rusqlite::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE sessions SET end = ?, num_cmds = ? WHERE session = ?",
            params![now, num_cmds, session],
        )?;
        Ok(())
    }

    pub fn rename_session(&self, session: i64, remark: &str) -> rusqlite::Result<bool> {
        let updated = self.conn.execute(
            "UPDATE sessions SET remark = ? WHERE session = ?",
            params![remark, session],
        )?;
        Ok(updated > 0)
    }

    pub fn session_info(&self, session: i64) -> rusqlite::Result<Option<SessionInfo>> {
        self.conn
            .query_row(
                "SELECT * FROM sessions WHERE session = ?",
                params![session],
                |row| {
                    Ok(SessionInfo {
                        session: row.get(0)?,
                        start: row.get(1)?,
                        end: row.get(2)?,
                        num_cmds: row.get(3)?,
                        remark: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    pub fn last_session_id(&self) -> rusqlite::Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT session FROM sessions ORDER BY session DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Insert a batch of input and output rows in one transaction. On
    /// failure nothing is committed and the rows stay with the caller.
    pub fn append_rows(&self, inputs: &[InputRow], outputs: &[OutputRow]) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for row in inputs {
            tx.execute(
                "INSERT INTO history VALUES (?, ?, ?, ?)",
                params![row.session, row.line, row.source, row.source_raw],
            )?;
        }
        for row in outputs {
            tx.execute(
                "INSERT INTO output_history VALUES (?, ?, ?)",
                params![row.session, row.line, row.output],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Reading ────────────────────────────────────────────────────

    /// One session's lines in `[start, stop)`, in line order. `stop` of
    /// `None` reads to the end of the session.
    pub fn session_lines(
        &self,
        session: i64,
        start: i64,
        stop: Option<i64>,
        raw: bool,
        include_output: bool,
    ) -> rusqlite::Result<Vec<HistoryEntry>> {
        match stop {
            Some(stop) => self.select_entries(
                "WHERE session = ? AND line >= ? AND line < ?",
                params![session, start, stop],
                raw,
                include_output,
            ),
            None => self.select_entries(
                "WHERE session = ? AND line >= ?",
                params![session, start],
                raw,
                include_output,
            ),
        }
    }

    /// Glob search over raw or processed source text (wildcards `*` and
    /// `?`, escape with backslash). With a limit, the n most recent
    /// matches are returned in chronological order.
    pub fn search_glob(
        &self,
        pattern: &str,
        n: Option<usize>,
        raw: bool,
        include_output: bool,
    ) -> rusqlite::Result<Vec<HistoryEntry>> {
        let column = if raw { "source_raw" } else { "source" };
        let tosearch = if include_output {
            format!("history.{column}")
        } else {
            column.to_string()
        };
        match n {
            Some(n) => {
                let condition =
                    format!("WHERE {tosearch} GLOB ? ORDER BY session DESC, line DESC LIMIT ?");
                let mut results = self.select_entries(
                    &condition,
                    params![pattern, n as i64],
                    raw,
                    include_output,
                )?;
                results.reverse(); // chronological order
                Ok(results)
            }
            None => self.select_entries(
                &format!("WHERE {tosearch} GLOB ?"),
                params![pattern],
                raw,
                include_output,
            ),
        }
    }

    /// The n most recent lines across all sessions, oldest first.
    pub fn tail(
        &self,
        n: usize,
        raw: bool,
        include_output: bool,
    ) -> rusqlite::Result<Vec<HistoryEntry>> {
        let mut results = self.select_entries(
            "ORDER BY session DESC, line DESC LIMIT ?",
            params![n as i64],
            raw,
            include_output,
        )?;
        results.reverse(); // chronological order
        Ok(results)
    }

    fn select_entries(
        &self,
        condition: &str,
        params: &[&dyn rusqlite::types::ToSql],
        raw: bool,
        include_output: bool,
    ) -> rusqlite::Result<Vec<HistoryEntry>> {
        let column = if raw { "source_raw" } else { "source" };
        let sql = if include_output {
            format!(
                "SELECT session, line, history.{column}, output_history.output \
                 FROM history LEFT JOIN output_history USING (session, line) {condition}"
            )
        } else {
            format!("SELECT session, line, {column} FROM history {condition}")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(HistoryEntry {
                session: row.get(0)?,
                line: row.get(1)?,
                source: row.get(2)?,
                output: if include_output {
                    decode_output(row.get(3)?)
                } else {
                    None
                },
            })
        })?;
        rows.collect()
    }
}

fn decode_output(stored: Option<String>) -> Option<Vec<String>> {
    let text = stored?;
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(&text) {
        Ok(values) => Some(values),
        Err(e) => {
            tracing::warn!("Dropping undecodable output record: {e}");
            None
        }
    }
}

// ── Data types ─────────────────────────────────────────────────────

/// A pending input line bound for the history table.
#[derive(Debug, Clone)]
pub struct InputRow {
    pub session: i64,
    pub line: i64,
    pub source: String,
    pub source_raw: String,
}

/// A pending serialized output record.
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub session: i64,
    pub line: i64,
    pub output: String,
}

/// One line of history as returned by queries. `source` holds raw or
/// processed text depending on what was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub session: i64,
    pub line: i64,
    pub source: String,
    pub output: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session: i64,
    pub start: String,
    pub end: Option<String>,
    pub num_cmds: Option<i64>,
    pub remark: Option<String>,
}
