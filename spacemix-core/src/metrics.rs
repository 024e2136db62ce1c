//! Runtime counters.
//!
//! Lock-free `AtomicU64` counters incremented on the hot path and read on
//! export. Span timing is left to `tracing` instrumentation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters.
#[derive(Debug)]
pub struct EngineCounters {
    /// Records ingested successfully.
    pub records_ingested: AtomicU64,
    /// Records rejected during ingestion.
    pub ingest_failures: AtomicU64,
    /// Events applied.
    pub events_applied: AtomicU64,
    /// Events rejected by validation or de-duplication.
    pub events_rejected: AtomicU64,
    /// Queries executed.
    pub queries_executed: AtomicU64,
    /// Natural-language extractions attempted.
    pub nl_resolutions: AtomicU64,
    /// Natural-language extractions that failed or timed out.
    pub nl_failures: AtomicU64,
}

impl EngineCounters {
    /// Zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records_ingested: AtomicU64::new(0),
            ingest_failures: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            nl_resolutions: AtomicU64::new(0),
            nl_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            ingest_failures: self.ingest_failures.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            nl_resolutions: self.nl_resolutions.load(Ordering::Relaxed),
            nl_failures: self.nl_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Records ingested successfully.
    pub records_ingested: u64,
    /// Records rejected during ingestion.
    pub ingest_failures: u64,
    /// Events applied.
    pub events_applied: u64,
    /// Events rejected.
    pub events_rejected: u64,
    /// Queries executed.
    pub queries_executed: u64,
    /// Natural-language extractions attempted.
    pub nl_resolutions: u64,
    /// Natural-language extractions failed.
    pub nl_failures: u64,
}

impl CounterSnapshot {
    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows = [
            ("records_ingested", "Records ingested", self.records_ingested),
            ("ingest_failures", "Records rejected during ingestion", self.ingest_failures),
            ("events_applied", "Interaction events applied", self.events_applied),
            ("events_rejected", "Interaction events rejected", self.events_rejected),
            ("queries_executed", "Queries executed", self.queries_executed),
            ("nl_resolutions", "Natural-language extractions attempted", self.nl_resolutions),
            ("nl_failures", "Natural-language extractions failed", self.nl_failures),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!(
                "# HELP spacemix_{name}_total {help}\n\
                 # TYPE spacemix_{name}_total counter\n\
                 spacemix_{name}_total {value}\n"
            ));
        }
        out
    }
}
