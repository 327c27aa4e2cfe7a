use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::error;

use crate::collector::{EventCollector, FlowRecord, UserRecord};
use crate::error::DatapathError;

#[derive(Debug, Serialize)]
struct StatsPayload<'a> {
    #[serde(rename = "Flows")]
    flows: &'a [FlowRecord],
    #[serde(rename = "Users")]
    users: &'a [UserRecord],
}

#[derive(Debug, Serialize)]
struct StatsRequest<'a> {
    #[serde(rename = "Payload")]
    payload: StatsPayload<'a>,
}

impl serde::Serialize for FlowRecord {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("FlowRecord", 9)?;
        st.serialize_field("ContextID", &self.context_id)?;
        st.serialize_field("SourceID", &self.source.id)?;
        st.serialize_field("DestinationID", &self.destination.id)?;
        st.serialize_field("Action", &format!("{:?}", self.action))?;
        st.serialize_field("DropReason", &self.drop_reason)?;
        st.serialize_field("PolicyID", &self.policy_id)?;
        st.serialize_field("ObservedAction", &self.observed_action.map(|a| format!("{a:?}")))?;
        st.serialize_field("ObservedPolicyID", &self.observed_policy_id)?;
        st.serialize_field("L4Protocol", &format!("{:?}", self.l4_protocol))?;
        st.end()
    }
}

impl serde::Serialize for UserRecord {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = s.serialize_struct("UserRecord", 1)?;
        st.serialize_field("ID", &self.id)?;
        st.end()
    }
}

/// Abstracts the RPC transport as an external collaborator: `{Payload:
/// {Flows, Users}}` out, empty response expected.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send_stats(&self, flows: &[FlowRecord], users: &[UserRecord]) -> Result<(), DatapathError>;
}

/// A minimal, real (not mock) transport over a Unix-domain stream socket:
/// one newline-delimited JSON request per call.
pub struct UnixSocketStatsTransport {
    path: String,
    secret: String,
}

impl UnixSocketStatsTransport {
    /// Reads `STATS_CHANNEL_PATH` and `STATS_SECRET`; both must be present.
    pub fn from_env() -> Result<Self, DatapathError> {
        let path = std::env::var("STATS_CHANNEL_PATH")
            .map_err(|_| DatapathError::Fatal("STATS_CHANNEL_PATH not set".into()))?;
        let secret = std::env::var("STATS_SECRET").map_err(|_| DatapathError::Fatal("STATS_SECRET not set".into()))?;
        Ok(UnixSocketStatsTransport { path, secret })
    }

    pub fn new(path: impl Into<String>, secret: impl Into<String>) -> Self {
        UnixSocketStatsTransport { path: path.into(), secret: secret.into() }
    }
}

#[async_trait]
impl RpcTransport for UnixSocketStatsTransport {
    async fn send_stats(&self, flows: &[FlowRecord], users: &[UserRecord]) -> Result<(), DatapathError> {
        let request = StatsRequest { payload: StatsPayload { flows, users } };
        let mut line = serde_json::to_vec(&request).map_err(|e| DatapathError::Transient(e.to_string()))?;
        line.push(b'\n');

        let mut stream = UnixStream::connect(&self.path).await.map_err(|e| DatapathError::Transient(e.to_string()))?;
        stream.write_all(self.secret.as_bytes()).await.map_err(|e| DatapathError::Transient(e.to_string()))?;
        stream.write_all(b"\n").await.map_err(|e| DatapathError::Transient(e.to_string()))?;
        stream.write_all(&line).await.map_err(|e| DatapathError::Transient(e.to_string()))?;
        Ok(())
    }
}

/// Drains the collector on a 1s ticker and sends a single request over the
/// RPC transport; a secondary 10-minute ticker flushes the user retention
/// cache. Send errors are logged and never stop the task.
pub struct StatsExporter {
    collector: Arc<dyn EventCollector>,
    transport: Arc<dyn RpcTransport>,
    stats_interval: Duration,
    user_retention_interval: Duration,
}

impl StatsExporter {
    pub fn new(
        collector: Arc<dyn EventCollector>,
        transport: Arc<dyn RpcTransport>,
        stats_interval: Duration,
        user_retention_interval: Duration,
    ) -> Self {
        StatsExporter { collector, transport, stats_interval, user_retention_interval }
    }

    /// Runs until `cancel` fires; in-flight sends are allowed to finish, no
    /// drain-to-completion is attempted beyond that.
    pub async fn run(self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        let mut stats_ticker = tokio::time::interval(self.stats_interval);
        let mut user_ticker = tokio::time::interval(self.user_retention_interval);
        loop {
            tokio::select! {
                _ = stats_ticker.tick() => {
                    let flows = self.collector.get_all_records();
                    let users = self.collector.get_user_records();
                    if flows.is_empty() && users.is_empty() {
                        continue;
                    }
                    if let Err(err) = self.transport.send_stats(&flows, &users).await {
                        error!(%err, "RPC failure sending statistics");
                    }
                }
                _ = user_ticker.tick() => {
                    self.collector.flush_user_cache();
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::InMemoryCollector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trireme_packet::IpProto;

    struct RecordingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcTransport for RecordingTransport {
        async fn send_stats(&self, _flows: &[FlowRecord], _users: &[UserRecord]) -> Result<(), DatapathError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn sample_flow() -> FlowRecord {
        use crate::collector::{EndpointKind, FlowEndpoint};
        use crate::policy::Action;
        FlowRecord {
            context_id: "pu-1".to_string(),
            source: FlowEndpoint { id: "a".to_string(), ip: [10, 0, 0, 1], port: 1, kind: EndpointKind::ProcessingUnit },
            destination: FlowEndpoint { id: "b".to_string(), ip: [10, 0, 0, 2], port: 2, kind: EndpointKind::ProcessingUnit },
            tags: vec![],
            action: Action::Accept,
            drop_reason: None,
            policy_id: "p1".to_string(),
            l4_protocol: IpProto::Tcp,
            observed_action: None,
            observed_policy_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exporter_sends_on_each_tick_and_skips_empty() {
        let collector = Arc::new(InMemoryCollector::new(10));
        let transport = Arc::new(RecordingTransport { calls: AtomicUsize::new(0) });
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let exporter = StatsExporter::new(collector.clone(), transport.clone(), Duration::from_millis(10), Duration::from_secs(600));
        let handle = tokio::spawn(exporter.run(cancel_rx));

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.calls.load(Ordering::Relaxed), 0); // nothing collected yet

        collector.collect_flow_event(sample_flow());
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.calls.load(Ordering::Relaxed), 1);

        cancel_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
