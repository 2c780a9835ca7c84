//! Boundary to the log storage engine.
//!
//! The distribution server only needs to read records from a position,
//! append records received from producers and report the store's logical
//! name. [`MemoryLogStore`] implements that contract in memory for tests
//! and for running the server standalone.

pub mod types;

pub use types::*;

use std::sync::RwLock;

use tracing::debug;

use crate::{Error, Result};

/// Shared handle to the THL storage engine.
pub trait LogStore: Send + Sync + 'static {
    /// Logical store name used in diagnostics.
    fn name(&self) -> &str;

    /// Up to `max` records with `seqno >= from_seqno`, in append order.
    fn fetch(&self, from_seqno: u64, max: usize) -> Result<Vec<LogRecord>>;

    /// Appends a record; sequence numbers must not go backwards.
    fn append(&self, record: LogRecord) -> Result<()>;

    /// Highest stored sequence number, `None` when empty.
    fn max_seqno(&self) -> Result<Option<u64>>;
}

pub struct MemoryLogStore {
    name: String,
    records: RwLock<Vec<LogRecord>>,
}

impl MemoryLogStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStore for MemoryLogStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, from_seqno: u64, max: usize) -> Result<Vec<LogRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Store(format!("store {} lock poisoned", self.name)))?;

        // Records are kept sorted by (seqno, fragno).
        let start = records.partition_point(|r| r.seqno < from_seqno);
        Ok(records[start..].iter().take(max).cloned().collect())
    }

    fn append(&self, record: LogRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Store(format!("store {} lock poisoned", self.name)))?;

        if let Some(last) = records.last() {
            if (record.seqno, record.fragno) <= (last.seqno, last.fragno) {
                return Err(Error::Store(format!(
                    "out of order append: seqno={} fragno={} after seqno={} fragno={}",
                    record.seqno, record.fragno, last.seqno, last.fragno
                )));
            }
        }

        debug!(store = %self.name, seqno = record.seqno, "Appended record");
        records.push(record);
        Ok(())
    }

    fn max_seqno(&self) -> Result<Option<u64>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Store(format!("store {} lock poisoned", self.name)))?;
        Ok(records.last().map(|r| r.seqno))
    }
}
