//! Per-session counters.

use serde::Serialize;

/// A point-in-time view of a session's activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    /// Entities in the persistence context.
    pub entity_count: usize,
    /// Collections tracked by the persistence context.
    pub collection_count: usize,
    /// Write actions waiting for the next flush.
    pub pending_actions: usize,
    pub flushes: u64,
    /// Statements executed, counting each statement of a batch.
    pub statements: u64,
    /// Batches submitted in one round trip.
    pub batches: u64,
    pub queries: u64,
    pub transactions: u64,
    /// Tables touched by bulk statements, most recent last.
    pub bulk_affected_tables: Vec<String>,
}

/// Counters the session updates as it works.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub flushes: u64,
    pub queries: u64,
    pub bulk_affected_tables: Vec<String>,
}

impl Counters {
    pub fn record_bulk_table(&mut self, table: &str) {
        self.bulk_affected_tables.retain(|t| t != table);
        self.bulk_affected_tables.push(table.to_string());
    }
}
