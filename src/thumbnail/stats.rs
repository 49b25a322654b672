//! Engine counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time view of engine activity
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub cache_hits: u64,
    /// Requests that joined an existing job instead of creating one
    pub deduplicated: u64,
    pub escalations: u64,
    pub generated: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub total_generation_ms: u64,
    pub average_generation_ms: f64,
    pub queued_interactive: usize,
    pub queued_background: usize,
    /// Jobs created but not yet completed, queued or running
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    escalations: AtomicU64,
    generated: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    total_generation_ms: AtomicU64,
}

impl StatsRecorder {
    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escalated(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self, count: usize) {
        self.cancelled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record one finished generation attempt
    pub fn generation(&self, elapsed: Duration, succeeded: bool) {
        let counter = if succeeded {
            &self.generated
        } else {
            &self.failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_generation_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Counter snapshot; queue figures are filled in by the caller
    pub fn snapshot(&self) -> EngineStats {
        let generated = self.generated.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total_generation_ms = self.total_generation_ms.load(Ordering::Relaxed);
        let attempts = generated + failures;

        EngineStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            generated,
            failures,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            total_generation_ms,
            average_generation_ms: if attempts > 0 {
                total_generation_ms as f64 / attempts as f64
            } else {
                0.0
            },
            ..EngineStats::default()
        }
    }
}
