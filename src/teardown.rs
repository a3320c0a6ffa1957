//! Teardown instrumentation
//!
//! Guards (pipelines, supervised processes) push a record here at the moment
//! they release their resource. Scenarios that care about cleanup ordering
//! share one log between all of their guards and inspect it afterwards.

use std::sync::Arc;
use std::time::Instant;
use parking_lot::Mutex;

use crate::process::ProcessRole;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownEvent {
    /// Pipeline forced to the Null state
    PipelineStopped,
    /// Supervised process killed (or found already exited) and reaped
    ProcessKilled { role: ProcessRole, pid: u32 },
}

#[derive(Debug, Clone)]
pub struct TeardownRecord {
    pub event: TeardownEvent,
    pub at: Instant,
}

/// Shared, append-only teardown log
#[derive(Debug, Clone, Default)]
pub struct TeardownLog {
    records: Arc<Mutex<Vec<TeardownRecord>>>,
}

impl TeardownLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: TeardownEvent) {
        log::debug!("teardown: {:?}", event);
        self.records.lock().push(TeardownRecord { event, at: Instant::now() });
    }

    #[must_use]
    pub fn records(&self) -> Vec<TeardownRecord> {
        self.records.lock().clone()
    }

    /// Time of the first record matching `pred`
    pub fn first_at(&self, pred: impl Fn(&TeardownEvent) -> bool) -> Option<Instant> {
        self.records.lock().iter().find(|r| pred(&r.event)).map(|r| r.at)
    }

    /// Pids of every process the log saw killed
    #[must_use]
    pub fn killed_pids(&self) -> Vec<u32> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r.event {
                TeardownEvent::ProcessKilled { pid, .. } => Some(pid),
                TeardownEvent::PipelineStopped => None,
            })
            .collect()
    }
}
