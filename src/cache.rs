use crate::error::HistoryError;
use crate::store::{HistoryStore, InputRow, OutputRow};

/// Buffers rows headed for the store and commits them in batches.
pub struct WriteCache {
    cache_size: usize,
    inputs: Vec<InputRow>,
    outputs: Vec<OutputRow>,
}

impl WriteCache {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache_size,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Batching is off for thresholds of 1 or less: every input line is
    /// written out as it arrives and output rows bypass the cache.
    pub fn batching_enabled(&self) -> bool {
        self.cache_size > 1
    }

    pub fn push_input(&mut self, row: InputRow) {
        self.inputs.push(row);
    }

    pub fn push_output(&mut self, row: OutputRow) {
        self.outputs.push(row);
    }

    /// True once enough input lines have accumulated to trigger a write.
    pub fn should_flush(&self) -> bool {
        self.inputs.len() >= self.cache_size
    }

    pub fn pending_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Write all buffered rows to the store in one transaction, then
    /// clear the buffers. A no-op when nothing is buffered. On failure
    /// the rows are kept so the caller can retry.
    pub fn flush(&mut self, store: &HistoryStore) -> Result<(), HistoryError> {
        if self.inputs.is_empty() && self.outputs.is_empty() {
            return Ok(());
        }
        store
            .append_rows(&self.inputs, &self.outputs)
            .map_err(|source| HistoryError::Flush { source })?;
        tracing::debug!(
            "Flushed {} input and {} output rows",
            self.inputs.len(),
            self.outputs.len()
        );
        self.inputs.clear();
        self.outputs.clear();
        Ok(())
    }
}
