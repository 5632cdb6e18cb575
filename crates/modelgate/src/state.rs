//! State shared by every HTTP handler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::orchestrator::Orchestrator;

/// Lock-free request counters.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub failed_requests: AtomicUsize,
    pub streamed_responses: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_failed_requests(&self) -> usize {
        self.failed_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_streamed_responses(&self) -> usize {
        self.streamed_responses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            streamed_responses: self.streamed_responses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub streamed_responses: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub counters: Arc<AtomicCounters>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            counters: Arc::new(AtomicCounters::new()),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment_independently() {
        let counters = AtomicCounters::new();
        assert_eq!(counters.inc_total_requests(), 1);
        assert_eq!(counters.inc_total_requests(), 2);
        assert_eq!(counters.inc_failed_requests(), 1);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.streamed_responses, 0);
    }
}
