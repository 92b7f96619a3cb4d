use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monitoring counters kept by the engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    instances_started: AtomicU64,
    instances_completed: AtomicU64,
    instances_terminated: AtomicU64,
    tasks_completed: AtomicU64,
    history_write_failures: AtomicU64,
    listener_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub instances_started: u64,
    pub instances_completed: u64,
    pub instances_terminated: u64,
    pub tasks_completed: u64,
    pub history_write_failures: u64,
    pub listener_failures: u64,
}

impl EngineMetrics {
    pub fn instance_started(&self) {
        self.instances_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_completed(&self) {
        self.instances_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_terminated(&self) {
        self.instances_terminated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn history_write_failed(&self) {
        self.history_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instances_started: self.instances_started.load(Ordering::Relaxed),
            instances_completed: self.instances_completed.load(Ordering::Relaxed),
            instances_terminated: self.instances_terminated.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            history_write_failures: self.history_write_failures.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
        }
    }
}
