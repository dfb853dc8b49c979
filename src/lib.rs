//! Session-oriented command history: every input line (and optionally
//! its output) is recorded to a SQLite store shared across sessions,
//! with in-memory buffers for the live session and a write-back cache
//! between the two.

mod cache;
mod config;
mod error;
mod manager;
mod range;
mod store;

pub use cache::WriteCache;
pub use config::HistoryConfig;
pub use error::HistoryError;
pub use manager::{HistoryManager, NoopBinder, VariableBinder};
pub use range::{extract_ranges, format_line_label, RangeSelector};
pub use store::{HistoryEntry, HistoryStore, InputRow, OutputRow, SessionInfo};
