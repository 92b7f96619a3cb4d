use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::error;

use crate::engine::ProcessEngine;
use crate::engine::error::Result;
use crate::engine::metrics::EngineMetrics;
use crate::engine::types::{
    ActivityInstance, HistoryEvent, HistoryEventKind, ProcessInstance, Task,
};
use crate::storage::StateStore;

/// Appends audit records to the store.
pub struct HistoryRecorder {
    store: Arc<dyn StateStore>,
    seq: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn StateStore>, last_seq: u64, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(last_seq),
            metrics,
        }
    }

    /// Stamp and append an event.
    ///
    /// A failed write is logged and counted; the caller carries on.
    pub async fn record(&self, mut event: HistoryEvent) -> HistoryEvent {
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        event.timestamp = Utc::now();

        if let Err(e) = self.store.append_history(&event).await {
            error!(
                seq = event.seq,
                instance_id = %event.instance_id,
                kind = %event.kind,
                error = %format!("{:#}", e),
                "Failed to write history event"
            );
            self.metrics.history_write_failed();
        }
        event
    }

    pub async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEvent>> {
        let mut events: Vec<HistoryEvent> = self
            .store
            .list_history()
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        // Seq is the recording order; wall-clock stamps may tie or step backwards.
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }
}

/// History query; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub instance_id: Option<String>,
    pub task_id: Option<String>,
    pub kind: Option<HistoryEventKind>,
}

impl HistoryFilter {
    pub fn instance(mut self, id: &str) -> Self {
        self.instance_id = Some(id.to_string());
        self
    }

    pub fn task(mut self, id: &str) -> Self {
        self.task_id = Some(id.to_string());
        self
    }

    pub fn kind(mut self, kind: HistoryEventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn matches(&self, event: &HistoryEvent) -> bool {
        self.instance_id.as_ref().is_none_or(|id| *id == event.instance_id)
            && self
                .task_id
                .as_ref()
                .is_none_or(|id| event.task_id.as_ref() == Some(id))
            && self.kind.is_none_or(|k| k == event.kind)
    }
}

/// Pair entered/exited events into node visits, in entry order.
pub fn fold_activities(events: &[HistoryEvent]) -> Vec<ActivityInstance> {
    let mut activities: Vec<ActivityInstance> = Vec::new();
    for event in events {
        let Some(node_id) = event.node_id.as_deref() else {
            continue;
        };
        match event.kind {
            HistoryEventKind::ActivityEntered => activities.push(ActivityInstance {
                instance_id: event.instance_id.clone(),
                node_id: node_id.to_string(),
                entered_at: event.timestamp,
                exited_at: None,
            }),
            HistoryEventKind::ActivityExited => {
                if let Some(open) = activities.iter_mut().rev().find(|a| {
                    a.exited_at.is_none() && a.instance_id == event.instance_id && a.node_id == node_id
                }) {
                    open.exited_at = Some(event.timestamp);
                }
            }
            _ => {}
        }
    }
    activities
}

impl ProcessEngine {
    /// History events matching `filter`, in recording (`seq`) order.
    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEvent>> {
        self.history.query(filter).await
    }

    /// Node visits, optionally for one instance.
    pub async fn activity_instances(&self, instance_id: Option<&str>) -> Result<Vec<ActivityInstance>> {
        let mut filter = HistoryFilter::default();
        filter.instance_id = instance_id.map(str::to_string);
        let events = self.history.query(&filter).await?;
        Ok(fold_activities(&events))
    }

    /// Every known instance, running or finished, newest first.
    pub async fn historic_instances(&self) -> Vec<ProcessInstance> {
        let entries: Vec<_> = self.instances.read().await.values().cloned().collect();
        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            instances.push(entry.state.lock().await.clone());
        }
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        instances
    }

    /// Every task, open or finished.
    pub async fn historic_tasks(&self) -> Vec<Task> {
        self.list_tasks().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: HistoryEventKind, node: &str, seq: u64) -> HistoryEvent {
        let mut e = HistoryEvent::new(kind, "i1").node(node);
        e.seq = seq;
        e
    }

    #[test]
    fn folds_entered_and_exited_pairs() {
        let events = vec![
            event(HistoryEventKind::ActivityEntered, "start", 1),
            event(HistoryEventKind::ActivityExited, "start", 2),
            event(HistoryEventKind::ActivityEntered, "approve", 3),
        ];
        let acts = fold_activities(&events);
        assert_eq!(acts.len(), 2);
        assert!(acts[0].exited_at.is_some());
        assert_eq!(acts[1].node_id, "approve");
        assert!(acts[1].exited_at.is_none());
    }

    #[test]
    fn filter_combines_fields() {
        let e = HistoryEvent::new(HistoryEventKind::TaskCompleted, "i1").task("t1");
        assert!(HistoryFilter::default().matches(&e));
        assert!(HistoryFilter::default().instance("i1").task("t1").matches(&e));
        assert!(!HistoryFilter::default().instance("i2").matches(&e));
        assert!(!HistoryFilter::default().kind(HistoryEventKind::Started).matches(&e));
    }

    #[tokio::test]
    async fn query_orders_by_seq_even_when_clock_steps_back() {
        let store: Arc<dyn StateStore> = Arc::new(crate::storage::memory_store::MemoryStateStore::new());
        let now = Utc::now();
        for (seq, offset) in [(3, -30), (1, 0), (2, -60)] {
            let mut e = event(HistoryEventKind::ActivityEntered, "n", seq);
            e.timestamp = now + chrono::Duration::seconds(offset);
            store.append_history(&e).await.unwrap();
        }

        let recorder = HistoryRecorder::new(store, 3, Arc::new(EngineMetrics::default()));
        let seqs: Vec<u64> = recorder
            .query(&HistoryFilter::default())
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
