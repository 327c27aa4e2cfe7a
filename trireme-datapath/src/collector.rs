use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use trireme_packet::IpProto;

use crate::policy::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ProcessingUnit,
    ExternalIp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEndpoint {
    pub id: String,
    pub ip: [u8; 4],
    pub port: u16,
    pub kind: EndpointKind,
}

/// One admitted-or-denied flow, handed to the collector by the flow
/// reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub context_id: String,
    pub source: FlowEndpoint,
    pub destination: FlowEndpoint,
    pub tags: Vec<(String, String)>,
    pub action: Action,
    pub drop_reason: Option<&'static str>,
    pub policy_id: String,
    pub l4_protocol: IpProto,
    pub observed_action: Option<Action>,
    pub observed_policy_id: Option<String>,
}

/// An identity observed on a flow, retained briefly so repeated sightings
/// of the same peer don't generate redundant audit noise. Flushed by the
/// stats exporter's 10-minute ticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub tags: Vec<(String, String)>,
}

/// A sink for flow events and a short-lived cache of user records, both
/// drained periodically by the stats exporter.
pub trait EventCollector: Send + Sync {
    fn collect_flow_event(&self, record: FlowRecord);
    fn collect_user_record(&self, record: UserRecord);
    fn get_all_records(&self) -> Vec<FlowRecord>;
    fn get_user_records(&self) -> Vec<UserRecord>;
    fn flush_user_cache(&self);
    /// Count of flow records dropped because the queue was full. Exposed so
    /// tests and the metrics module can assert on it without digging
    /// through internal state.
    fn dropped_overflow_count(&self) -> u64;
}

/// Backs both the flow reporter and the stats exporter with a single
/// bounded, drop-oldest buffer: the same collector instance in both
/// places, not two separate queues.
pub struct InMemoryCollector {
    flows: Mutex<Vec<FlowRecord>>,
    users: Mutex<Vec<UserRecord>>,
    capacity: usize,
    dropped_overflow: AtomicU64,
}

impl InMemoryCollector {
    pub fn new(capacity: usize) -> Self {
        InMemoryCollector { flows: Mutex::new(Vec::new()), users: Mutex::new(Vec::new()), capacity, dropped_overflow: AtomicU64::new(0) }
    }
}

impl EventCollector for InMemoryCollector {
    fn collect_flow_event(&self, record: FlowRecord) {
        let mut flows = self.flows.lock().expect("collector mutex poisoned");
        if flows.len() >= self.capacity {
            flows.remove(0);
            self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        }
        flows.push(record);
    }

    fn collect_user_record(&self, record: UserRecord) {
        let mut users = self.users.lock().expect("collector mutex poisoned");
        if !users.iter().any(|u| u.id == record.id) {
            users.push(record);
        }
    }

    fn get_all_records(&self) -> Vec<FlowRecord> {
        std::mem::take(&mut self.flows.lock().expect("collector mutex poisoned"))
    }

    fn get_user_records(&self) -> Vec<UserRecord> {
        self.users.lock().expect("collector mutex poisoned").clone()
    }

    fn flush_user_cache(&self) {
        self.users.lock().expect("collector mutex poisoned").clear();
    }

    fn dropped_overflow_count(&self) -> u64 {
        self.dropped_overflow.load(Ordering::Relaxed)
    }
}

struct ReporterQueue {
    buffer: Mutex<VecDeque<FlowRecord>>,
    capacity: usize,
    notify: Notify,
}

/// Hands flow records to the collector off the hot path. Producers
/// (worker threads running `process_packet`) never block: the buffer is a
/// bounded ring, and pushing onto a full one evicts the oldest queued
/// record to make room for the new one, the same drop-oldest rule
/// `InMemoryCollector` applies one layer downstream.
#[derive(Clone)]
pub struct FlowReporter {
    queue: Arc<ReporterQueue>,
}

impl FlowReporter {
    /// Spawns the background task that drains the queue into `collector`
    /// and returns a handle producers can clone freely.
    pub fn spawn(collector: std::sync::Arc<dyn EventCollector>, queue_capacity: usize) -> Self {
        let queue = Arc::new(ReporterQueue { buffer: Mutex::new(VecDeque::with_capacity(queue_capacity)), capacity: queue_capacity, notify: Notify::new() });
        let worker = queue.clone();
        tokio::spawn(async move {
            loop {
                let next = worker.buffer.lock().expect("flow queue mutex poisoned").pop_front();
                match next {
                    Some(record) => collector.collect_flow_event(record),
                    None => worker.notify.notified().await,
                }
            }
        });
        FlowReporter { queue }
    }

    /// Enqueues a flow record, evicting the oldest queued one first if the
    /// buffer is already at capacity. Returns `false` when an eviction was
    /// needed, so callers can count it as an overflow.
    pub fn report(&self, record: FlowRecord) -> bool {
        let mut buffer = self.queue.buffer.lock().expect("flow queue mutex poisoned");
        let had_room = buffer.len() < self.queue.capacity;
        if !had_room {
            buffer.pop_front();
        }
        buffer.push_back(record);
        drop(buffer);
        self.queue.notify.notify_one();
        had_room
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> FlowEndpoint {
        FlowEndpoint { id: id.to_string(), ip: [10, 0, 0, 1], port: 443, kind: EndpointKind::ProcessingUnit }
    }

    fn record(id: &str) -> FlowRecord {
        FlowRecord {
            context_id: id.to_string(),
            source: endpoint("src"),
            destination: endpoint("dst"),
            tags: Vec::new(),
            action: Action::Accept,
            drop_reason: None,
            policy_id: "p1".to_string(),
            l4_protocol: IpProto::Tcp,
            observed_action: None,
            observed_policy_id: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts_it() {
        let collector = InMemoryCollector::new(2);
        collector.collect_flow_event(record("a"));
        collector.collect_flow_event(record("b"));
        collector.collect_flow_event(record("c"));

        let all = collector.get_all_records();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].context_id, "b");
        assert_eq!(all[1].context_id, "c");
        assert_eq!(collector.dropped_overflow_count(), 1);
    }

    #[test]
    fn get_all_records_drains_the_buffer() {
        let collector = InMemoryCollector::new(10);
        collector.collect_flow_event(record("a"));
        assert_eq!(collector.get_all_records().len(), 1);
        assert_eq!(collector.get_all_records().len(), 0);
    }

    #[test]
    fn user_records_deduplicate_by_id() {
        let collector = InMemoryCollector::new(10);
        collector.collect_user_record(UserRecord { id: "u1".to_string(), tags: vec![] });
        collector.collect_user_record(UserRecord { id: "u1".to_string(), tags: vec![] });
        assert_eq!(collector.get_user_records().len(), 1);
        collector.flush_user_cache();
        assert_eq!(collector.get_user_records().len(), 0);
    }

    #[tokio::test]
    async fn flow_reporter_drops_oldest_on_overflow() {
        let collector = std::sync::Arc::new(InMemoryCollector::new(10));
        let reporter = FlowReporter::spawn(collector.clone(), 2);
        assert!(reporter.report(record("a")));
        assert!(reporter.report(record("b")));
        assert!(!reporter.report(record("c")));

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let all = collector.get_all_records();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].context_id, "b");
        assert_eq!(all[1].context_id, "c");
    }

    #[tokio::test]
    async fn flow_reporter_drains_into_collector() {
        let collector = std::sync::Arc::new(InMemoryCollector::new(10));
        let reporter = FlowReporter::spawn(collector.clone(), 10);
        assert!(reporter.report(record("a")));
        // allow the background task a scheduling slot to drain.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(collector.get_all_records().len(), 1);
    }
}
