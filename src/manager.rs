use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::cache::WriteCache;
use crate::config::HistoryConfig;
use crate::error::HistoryError;
use crate::range::extract_ranges;
use crate::store::{HistoryEntry, HistoryStore, InputRow, OutputRow};

// Exit commands are never recorded; replaying one from history would just
// end the session again.
const EXIT_COMMANDS: [&str; 8] = [
    "Quit", "quit", "Exit", "exit", "%Quit", "%quit", "%Exit", "%exit",
];

/// Receives the auto-variable bindings (`_i`, `_ii`, `_iii`, `_i<n>`)
/// after each stored input line. The front-end decides how to publish
/// them to the user.
pub trait VariableBinder {
    fn bind_variables(&mut self, bindings: HashMap<String, String>);
}

/// Binder for front-ends that do not publish auto-variables.
pub struct NoopBinder;

impl VariableBinder for NoopBinder {
    fn bind_variables(&mut self, _bindings: HashMap<String, String>) {}
}

/// Coordinates the current session's in-memory history with the
/// persistent store: session lifecycle, input/output recording through
/// the write-back cache, and retrieval across sessions.
pub struct HistoryManager {
    store: HistoryStore,
    cache: WriteCache,
    session_number: i64,
    log_output: bool,
    // Parallel processed/raw line buffers, seeded with a blank entry so
    // line numbers index directly.
    parsed_lines: Vec<String>,
    raw_lines: Vec<String>,
    // Live output values for the current session, keyed by line number.
    outputs: BTreeMap<i64, Vec<String>>,
    // Directories visited during the session.
    dir_trail: Vec<PathBuf>,
    // The current raw input and the three before it, most recent first.
    recent_raw: [String; 4],
    binder: Box<dyn VariableBinder>,
}

impl HistoryManager {
    /// Open (or create) the history database for `profile` under the
    /// configured data directory and begin a new session.
    pub fn start(
        profile: Option<&str>,
        config: &HistoryConfig,
        binder: Box<dyn VariableBinder>,
    ) -> Result<Self, HistoryError> {
        let path = config.history_file(profile);
        tracing::debug!("Opening history store at {}", path.display());
        let store = HistoryStore::open(&path, config.busy_timeout_ms)?;
        Self::with_store(store, config, binder)
    }

    /// Manager over an ephemeral in-memory store.
    pub fn in_memory(
        config: &HistoryConfig,
        binder: Box<dyn VariableBinder>,
    ) -> Result<Self, HistoryError> {
        Self::with_store(HistoryStore::open_in_memory()?, config, binder)
    }

    fn with_store(
        store: HistoryStore,
        config: &HistoryConfig,
        binder: Box<dyn VariableBinder>,
    ) -> Result<Self, HistoryError> {
        let mut manager = Self {
            store,
            cache: WriteCache::new(config.cache_size),
            session_number: 0,
            log_output: config.log_output,
            parsed_lines: vec![String::new()],
            raw_lines: vec![String::new()],
            outputs: BTreeMap::new(),
            dir_trail: initial_dir_trail(),
            recent_raw: Default::default(),
            binder,
        };
        manager.begin_session()?;
        Ok(manager)
    }

    fn begin_session(&mut self) -> Result<(), HistoryError> {
        self.session_number = self.store.open_session()?;
        tracing::info!("Opened history session {}", self.session_number);
        Ok(())
    }

    // ── Session lifecycle ──────────────────────────────────────────

    /// Flush pending rows and close the session, recording its end time
    /// and line count. The manager is sessionless afterwards until
    /// `reset(true)` opens a new one.
    pub fn end_session(&mut self) -> Result<(), HistoryError> {
        self.cache.flush(&self.store)?;
        let num_cmds = self.parsed_lines.len() as i64 - 1;
        self.store.close_session(self.session_number, num_cmds)?;
        tracing::info!(
            "Closed history session {} ({num_cmds} commands)",
            self.session_number
        );
        self.session_number = 0;
        Ok(())
    }

    /// Label the current session in the database.
    pub fn name_session(&mut self, name: &str) -> Result<(), HistoryError> {
        self.store.rename_session(self.session_number, name)?;
        Ok(())
    }

    /// Clear the in-memory session view and optionally begin a new
    /// session. The open session is closed first, which flushes, so
    /// everything recorded up to this point stays in the store.
    pub fn reset(&mut self, new_session: bool) -> Result<(), HistoryError> {
        if self.session_number != 0 {
            self.end_session()?;
        }
        self.parsed_lines = vec![String::new()];
        self.raw_lines = vec![String::new()];
        self.outputs.clear();
        self.dir_trail = initial_dir_trail();
        if new_session {
            self.begin_session()?;
        }
        Ok(())
    }

    pub fn session_number(&self) -> i64 {
        self.session_number
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    // ── Storing ────────────────────────────────────────────────────

    /// Record one executed input line.
    ///
    /// `source_raw` is the text as typed; it defaults to `source` when
    /// absent. Line numbers come from the caller's execution counter and
    /// must be presented in increasing order. Exit commands are dropped
    /// entirely. The in-memory buffers keep the text with trailing
    /// whitespace removed; the store receives it as passed.
    pub fn store_input(
        &mut self,
        line_num: i64,
        source: &str,
        source_raw: Option<&str>,
    ) -> Result<(), HistoryError> {
        let source_raw = source_raw.unwrap_or(source);

        if EXIT_COMMANDS.contains(&source_raw.trim()) {
            return Ok(());
        }

        self.parsed_lines.push(source.trim_end().to_string());
        self.raw_lines.push(source_raw.trim_end().to_string());

        self.cache.push_input(InputRow {
            session: self.session_number,
            line: line_num,
            source: source.to_string(),
            source_raw: source_raw.to_string(),
        });
        if self.cache.should_flush() {
            self.cache.flush(&self.store)?;
        }

        // Shift the auto-variable slots and hand out the new bindings
        self.recent_raw.rotate_right(1);
        self.recent_raw[0] = source_raw.to_string();

        let mut bindings = HashMap::new();
        bindings.insert("_i".to_string(), self.recent_raw[1].clone());
        bindings.insert("_ii".to_string(), self.recent_raw[2].clone());
        bindings.insert("_iii".to_string(), self.recent_raw[3].clone());
        bindings.insert(format!("_i{line_num}"), self.recent_raw[0].clone());
        self.binder.bind_variables(bindings);
        Ok(())
    }

    /// Note one output value produced by a line. Values accumulate until
    /// `store_output` serializes them.
    pub fn record_output(&mut self, line_num: i64, value: &str) {
        self.outputs.entry(line_num).or_default().push(value.to_string());
    }

    /// Persist the recorded output of a line as a JSON array of strings.
    /// Does nothing unless output logging is on and the line actually
    /// produced output.
    pub fn store_output(&mut self, line_num: i64) -> Result<(), HistoryError> {
        if !self.log_output {
            return Ok(());
        }
        let values = match self.outputs.get(&line_num) {
            Some(values) if !values.is_empty() => values,
            _ => return Ok(()),
        };
        let row = OutputRow {
            session: self.session_number,
            line: line_num,
            output: serde_json::to_string(values)?,
        };
        if self.cache.batching_enabled() {
            self.cache.push_output(row);
        } else {
            self.store.append_rows(&[], std::slice::from_ref(&row))?;
        }
        Ok(())
    }

    /// Record a visited directory.
    pub fn record_dir(&mut self, dir: impl Into<PathBuf>) {
        self.dir_trail.push(dir.into());
    }

    pub fn dir_history(&self) -> &[PathBuf] {
        &self.dir_trail
    }

    /// Write any pending cached rows to the store.
    pub fn flush(&mut self) -> Result<(), HistoryError> {
        self.cache.flush(&self.store)
    }

    // ── Retrieval ──────────────────────────────────────────────────

    /// Retrieve lines `[start, stop)` of one session.
    ///
    /// A `session` of 0 (or the live session number) serves straight
    /// from the in-memory buffers; negative numbers count back from the
    /// current session. Past sessions are read from the store after a
    /// flush, so every line stored so far is visible. A `stop` of `None`
    /// or 0 reads to the end; negative `start`/`stop` count back from
    /// the end of the current session's buffer.
    pub fn get_history(
        &mut self,
        session: i64,
        start: i64,
        stop: Option<i64>,
        raw: bool,
        include_output: bool,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        if session == 0 || session == self.session_number {
            return Ok(self.current_session_lines(start, stop, raw, include_output));
        }
        let session = if session < 0 {
            session + self.session_number
        } else {
            session
        };
        self.cache.flush(&self.store)?;
        Ok(self
            .store
            .session_lines(session, start, stop, raw, include_output)?)
    }

    /// The n most recent lines across all sessions, oldest first.
    pub fn get_tail(
        &mut self,
        n: usize,
        raw: bool,
        include_output: bool,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.cache.flush(&self.store)?;
        Ok(self.store.tail(n, raw, include_output)?)
    }

    /// Glob search over all stored history, flushing first.
    pub fn get_search(
        &mut self,
        pattern: &str,
        n: Option<usize>,
        raw: bool,
        include_output: bool,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.cache.flush(&self.store)?;
        Ok(self.store.search_glob(pattern, n, raw, include_output)?)
    }

    /// Resolve a range expression (see [`extract_ranges`]) and gather
    /// the selected lines in order. An invalid range fails the whole
    /// call before any retrieval happens.
    pub fn get_range_from_string(
        &mut self,
        range_str: &str,
        raw: bool,
        include_output: bool,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = Vec::new();
        for selector in extract_ranges(range_str)? {
            entries.extend(self.get_history(
                selector.session,
                selector.start,
                selector.stop,
                raw,
                include_output,
            )?);
        }
        Ok(entries)
    }

    fn current_session_lines(
        &self,
        start: i64,
        stop: Option<i64>,
        raw: bool,
        include_output: bool,
    ) -> Vec<HistoryEntry> {
        let buf = if raw { &self.raw_lines } else { &self.parsed_lines };
        let n = buf.len() as i64;
        let mut start = start;
        let mut stop = match stop {
            None | Some(0) => n,
            Some(stop) => stop,
        };
        if start < 0 {
            start += n;
        }
        if stop < 0 {
            stop += n;
        }
        let mut entries = Vec::new();
        // Positions outside the buffer are skipped, not an error
        for i in start.max(0)..stop.min(n) {
            let output = if include_output {
                self.outputs.get(&i).filter(|v| !v.is_empty()).cloned()
            } else {
                None
            };
            entries.push(HistoryEntry {
                session: 0,
                line: i,
                source: buf[i as usize].clone(),
                output,
            });
        }
        entries
    }
}

fn initial_dir_trail() -> Vec<PathBuf> {
    match std::env::current_dir() {
        Ok(dir) => vec![dir],
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingBinder(Arc<Mutex<HashMap<String, String>>>);

    impl VariableBinder for RecordingBinder {
        fn bind_variables(&mut self, bindings: HashMap<String, String>) {
            self.0.lock().unwrap().extend(bindings);
        }
    }

    fn manager() -> HistoryManager {
        HistoryManager::in_memory(&HistoryConfig::default(), Box::new(NoopBinder)).unwrap()
    }

    fn manager_with(config: HistoryConfig) -> (HistoryManager, RecordingBinder) {
        let binder = RecordingBinder::default();
        let manager = HistoryManager::in_memory(&config, Box::new(binder.clone())).unwrap();
        (manager, binder)
    }

    #[test]
    fn test_store_input_round_trip() {
        let mut mgr = manager();
        mgr.store_input(1, "print(1)", Some("p 1  \n")).unwrap();

        let raw = mgr.get_history(0, 1, Some(2), true, false).unwrap();
        assert_eq!(raw[0].source, "p 1", "buffers hold right-stripped text");
        let parsed = mgr.get_history(0, 1, Some(2), false, false).unwrap();
        assert_eq!(parsed[0].source, "print(1)");
    }

    #[test]
    fn test_exit_commands_skipped() {
        let config = HistoryConfig {
            cache_size: 100,
            ..Default::default()
        };
        let (mut mgr, _binder) = manager_with(config);
        for (i, cmd) in EXIT_COMMANDS.iter().enumerate() {
            mgr.store_input(i as i64 + 1, cmd, None).unwrap();
        }
        mgr.store_input(9, "  exit  ", None).unwrap();
        assert_eq!(mgr.parsed_lines.len(), 1, "only the seed entry remains");
        assert_eq!(mgr.cache.pending_inputs(), 0);

        // Exit is only special as an exact trimmed match
        mgr.store_input(10, "exit_handler()", None).unwrap();
        assert_eq!(mgr.parsed_lines.len(), 2);
    }

    #[test]
    fn test_store_keeps_unstripped_text() {
        let mut mgr = manager();
        mgr.store_input(1, "x = 1   ", None).unwrap();
        let session = mgr.session_number();
        let stored = mgr
            .store()
            .session_lines(session, 1, None, true, false)
            .unwrap();
        assert_eq!(
            stored[0].source, "x = 1   ",
            "persisted rows keep trailing whitespace"
        );
        let buffered = mgr.get_history(0, 1, None, true, false).unwrap();
        assert_eq!(buffered[0].source, "x = 1");
    }

    #[test]
    fn test_auto_variable_rotation() {
        let (mut mgr, binder) = manager_with(HistoryConfig::default());
        mgr.store_input(1, "first", None).unwrap();
        mgr.store_input(2, "second", None).unwrap();
        mgr.store_input(3, "third", None).unwrap();

        let vars = binder.0.lock().unwrap();
        assert_eq!(vars["_i3"], "third");
        assert_eq!(vars["_i"], "second");
        assert_eq!(vars["_ii"], "first");
        assert_eq!(vars["_iii"], "");
        assert_eq!(vars["_i1"], "first");
        assert_eq!(vars["_i2"], "second");
    }

    #[test]
    fn test_current_session_slicing() {
        let mut mgr = manager();
        for i in 1..=5 {
            mgr.store_input(i, &format!("line{i}"), None).unwrap();
        }

        let all = mgr.get_history(0, 1, None, true, false).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].line, 1);

        // stop of 0 also means to the end
        let zero = mgr.get_history(0, 3, Some(0), true, false).unwrap();
        assert_eq!(zero.len(), 3);

        // negative indexes count back from the end of the buffer
        let last_two = mgr.get_history(0, -2, None, true, false).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].source, "line4");

        // out-of-range positions are skipped
        let clipped = mgr.get_history(0, -100, Some(100), true, false).unwrap();
        assert_eq!(clipped.len(), 6, "seed entry included from position 0");
    }

    #[test]
    fn test_current_session_by_live_id() {
        let mut mgr = manager();
        mgr.store_input(1, "buffered only", None).unwrap();
        let live = mgr.session_number();
        let via_id = mgr.get_history(live, 1, None, true, false).unwrap();
        assert_eq!(via_id.len(), 1);
        assert_eq!(via_id[0].session, 0, "current-session entries report 0");
    }

    #[test]
    fn test_output_logging_flag() {
        let mut mgr = manager();
        mgr.store_input(1, "1 + 1", None).unwrap();
        mgr.record_output(1, "2");
        mgr.store_output(1).unwrap();
        let session = mgr.session_number();
        let entries = mgr
            .store()
            .session_lines(session, 1, None, true, true)
            .unwrap();
        assert_eq!(entries[0].output, None, "logging is off by default");

        let config = HistoryConfig {
            log_output: true,
            ..Default::default()
        };
        let mut mgr = HistoryManager::in_memory(&config, Box::new(NoopBinder)).unwrap();
        mgr.store_input(1, "1 + 1", None).unwrap();
        mgr.record_output(1, "2");
        mgr.store_output(1).unwrap();
        mgr.store_input(2, "pass", None).unwrap();
        mgr.store_output(2).unwrap();

        let session = mgr.session_number();
        let entries = mgr
            .store()
            .session_lines(session, 1, None, true, true)
            .unwrap();
        assert_eq!(entries[0].output, Some(vec!["2".to_string()]));
        assert_eq!(entries[1].output, None, "no output row for silent lines");
    }

    #[test]
    fn test_in_memory_output_values() {
        let mut mgr = manager();
        mgr.store_input(1, "compute()", None).unwrap();
        mgr.record_output(1, "4");
        mgr.record_output(1, "5");

        let entries = mgr.get_history(0, 1, None, true, true).unwrap();
        assert_eq!(
            entries[0].output,
            Some(vec!["4".to_string(), "5".to_string()])
        );

        let without = mgr.get_history(0, 1, None, true, false).unwrap();
        assert_eq!(without[0].output, None);
    }

    #[test]
    fn test_reset_starts_fresh_session() {
        let mut mgr = manager();
        let first = mgr.session_number();
        mgr.store_input(1, "a", None).unwrap();
        mgr.store_input(2, "b", None).unwrap();
        mgr.record_dir("/tmp");

        mgr.reset(true).unwrap();
        assert!(mgr.session_number() > first);
        assert!(mgr.get_history(0, 1, None, true, false).unwrap().is_empty());
        assert_eq!(mgr.dir_history().len(), 1, "trail reseeds with the cwd");

        let info = mgr.store().session_info(first).unwrap().unwrap();
        assert_eq!(info.num_cmds, Some(2));
        assert!(info.end.is_some());

        // The old session's lines are still retrievable
        let old = mgr.get_history(first, 1, None, true, false).unwrap();
        assert_eq!(old.len(), 2);
    }

    #[test]
    fn test_reset_without_new_session() {
        let mut mgr = manager();
        mgr.store_input(1, "a", None).unwrap();
        mgr.reset(false).unwrap();
        assert_eq!(mgr.session_number(), 0);
    }

    #[test]
    fn test_negative_session_resolves_backwards() {
        let mut mgr = manager();
        let first = mgr.session_number();
        mgr.store_input(1, "from first session", None).unwrap();
        mgr.reset(true).unwrap();

        assert_eq!(mgr.session_number(), first + 1);
        let prev = mgr.get_history(-1, 1, None, true, false).unwrap();
        assert_eq!(prev.len(), 1);
        assert_eq!(prev[0].source, "from first session");
        assert_eq!(prev[0].session, first);
    }

    #[test]
    fn test_dir_trail() {
        let mut mgr = manager();
        assert_eq!(mgr.dir_history().len(), 1);
        mgr.record_dir("/somewhere/else");
        assert_eq!(mgr.dir_history().len(), 2);
        assert_eq!(mgr.dir_history()[1], PathBuf::from("/somewhere/else"));
    }
}
