use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::policy::PolicyDb;
use crate::tag::TagStore;

const UNENFORCE_GRACE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuKind {
    LinuxProcessPu,
    UidLoginPu,
    ContainerPu,
}

/// A single port or a half-open range `[start, end)`, tagged with the
/// owning PU at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    start: u16,
    end: u16,
}

impl PortSpec {
    pub fn single(port: u16) -> Self {
        PortSpec { start: port, end: port.saturating_add(1) }
    }

    pub fn range(start: u16, end: u16) -> Option<Self> {
        if start >= end {
            return None;
        }
        Some(PortSpec { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    fn width(&self) -> u32 {
        self.end as u32 - self.start as u32
    }
}

#[derive(Debug, Clone)]
pub struct PuContext {
    pub context_id: String,
    pub management_id: String,
    pub transmitter_label: String,
    pub mark: u32,
    pub ports: Vec<PortSpec>,
    pub tags: TagStore,
    pub policy: PolicyDb,
    pub external_ip_timeout: Duration,
    pub kind: PuKind,
}

impl PuContext {
    /// Every PU gets a `TransmitterLabel` tag equal to its management
    /// identity (which in turn defaults to the context identifier),
    /// appended once at construction.
    pub fn new(context_id: impl Into<String>, management_id: Option<String>, kind: PuKind) -> Self {
        let context_id = context_id.into();
        let management_id = management_id.unwrap_or_else(|| context_id.clone());
        let mut tags = TagStore::new();
        tags.push("TransmitterLabel", management_id.clone());
        PuContext {
            context_id,
            transmitter_label: management_id.clone(),
            management_id,
            mark: 0,
            ports: Vec::new(),
            tags,
            policy: PolicyDb::new(),
            external_ip_timeout: Duration::from_secs(60),
            kind,
        }
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_policy(mut self, policy: PolicyDb) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(key, value);
        self
    }
}

struct PortEntry {
    spec: PortSpec,
    context_id: String,
    inserted_at: u64,
}

/// Three lookup indices plus the IP slot used by remote-enforcer-mode
/// (container) PUs. Reads are the hot path (ingress/egress packet
/// processing); writes only happen on Enforce/Unenforce, a cold path.
pub struct PuRegistry {
    by_context_id: RwLock<AHashMap<String, Arc<PuContext>>>,
    by_mark: RwLock<AHashMap<u32, String>>,
    by_port: RwLock<Vec<PortEntry>>,
    by_ip: RwLock<AHashMap<[u8; 4], String>>,
    insertion_seq: AtomicU64,
}

impl Default for PuRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PuRegistry {
    pub fn new() -> Self {
        PuRegistry {
            by_context_id: RwLock::new(AHashMap::new()),
            by_mark: RwLock::new(AHashMap::new()),
            by_port: RwLock::new(Vec::new()),
            by_ip: RwLock::new(AHashMap::new()),
            insertion_seq: AtomicU64::new(0),
        }
    }

    /// Registers a PU. `LinuxProcessPu`/`UidLoginPu` are indexed by mark and
    /// port; any other kind (container PU) is indexed by `remote_ip`
    /// instead, for remote-enforcer mode.
    pub async fn enforce(&self, ctx: PuContext, remote_ip: Option<[u8; 4]>) -> Arc<PuContext> {
        if ctx.policy.allow_all {
            debug!(context_id = %ctx.context_id, "PU registered with AllowAll policy, rule scan will be skipped");
        }
        let ctx = Arc::new(ctx);

        match ctx.kind {
            PuKind::LinuxProcessPu | PuKind::UidLoginPu => {
                if ctx.mark != 0 {
                    self.by_mark.write().await.insert(ctx.mark, ctx.context_id.clone());
                }
                let mut ports = self.by_port.write().await;
                for spec in &ctx.ports {
                    let inserted_at = self.insertion_seq.fetch_add(1, Ordering::Relaxed);
                    ports.push(PortEntry { spec: *spec, context_id: ctx.context_id.clone(), inserted_at });
                }
            }
            PuKind::ContainerPu => {
                if let Some(ip) = remote_ip {
                    self.by_ip.write().await.insert(ip, ctx.context_id.clone());
                }
            }
        }

        self.by_context_id.write().await.insert(ctx.context_id.clone(), ctx.clone());
        ctx
    }

    pub async fn lookup_by_context_id(&self, context_id: &str) -> Option<Arc<PuContext>> {
        self.by_context_id.read().await.get(context_id).cloned()
    }

    pub async fn lookup_by_mark(&self, mark: u32) -> Option<Arc<PuContext>> {
        let context_id = self.by_mark.read().await.get(&mark).cloned()?;
        self.lookup_by_context_id(&context_id).await
    }

    pub async fn lookup_by_ip(&self, ip: [u8; 4]) -> Option<Arc<PuContext>> {
        let context_id = self.by_ip.read().await.get(&ip).cloned()?;
        self.lookup_by_context_id(&context_id).await
    }

    /// Longest-prefix-match over overlapping ranges (narrowest range wins);
    /// ties broken by most-recently-inserted.
    pub async fn lookup_by_port(&self, port: u16) -> Option<Arc<PuContext>> {
        let ports = self.by_port.read().await;
        let best = ports
            .iter()
            .filter(|e| e.spec.contains(port))
            .min_by_key(|e| (e.spec.width(), std::cmp::Reverse(e.inserted_at)))?;
        let context_id = best.context_id.clone();
        drop(ports);
        self.lookup_by_context_id(&context_id).await
    }

    /// Removes mark/port/ip entries immediately and schedules the
    /// contextID entry for deletion after a 10 s grace delay. During the
    /// grace window, `lookup_by_context_id` still resolves, so late
    /// in-flight packets for an `Established` flow don't spuriously fail
    /// with "no-context".
    pub async fn unenforce(self: &Arc<Self>, context_id: &str) {
        self.by_mark.write().await.retain(|_, v| v != context_id);
        self.by_port.write().await.retain(|e| e.context_id != context_id);
        self.by_ip.write().await.retain(|_, v| v != context_id);

        let registry = self.clone();
        let context_id = context_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(UNENFORCE_GRACE_DELAY).await;
            registry.by_context_id.write().await.remove(&context_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforce_indexes_process_pu_by_mark_and_port() {
        let registry = Arc::new(PuRegistry::new());
        let ctx = PuContext::new("pu-1", None, PuKind::LinuxProcessPu).with_mark(42).with_port(PortSpec::single(8080));
        registry.enforce(ctx, None).await;

        assert_eq!(registry.lookup_by_mark(42).await.unwrap().context_id, "pu-1");
        assert_eq!(registry.lookup_by_port(8080).await.unwrap().context_id, "pu-1");
    }

    #[tokio::test]
    async fn enforce_indexes_container_pu_by_ip() {
        let registry = Arc::new(PuRegistry::new());
        let ctx = PuContext::new("pu-2", None, PuKind::ContainerPu);
        registry.enforce(ctx, Some([10, 0, 0, 5])).await;

        assert_eq!(registry.lookup_by_ip([10, 0, 0, 5]).await.unwrap().context_id, "pu-2");
    }

    #[tokio::test]
    async fn port_lookup_prefers_narrower_range_on_overlap() {
        let registry = Arc::new(PuRegistry::new());
        let wide = PuContext::new("wide", None, PuKind::LinuxProcessPu).with_port(PortSpec::range(8000, 9000).unwrap());
        let narrow = PuContext::new("narrow", None, PuKind::LinuxProcessPu).with_port(PortSpec::range(8080, 8081).unwrap());
        registry.enforce(wide, None).await;
        registry.enforce(narrow, None).await;

        assert_eq!(registry.lookup_by_port(8080).await.unwrap().context_id, "narrow");
    }

    #[tokio::test]
    async fn transmitter_label_defaults_to_management_identity() {
        let ctx = PuContext::new("ctx-1", None, PuKind::LinuxProcessPu);
        assert_eq!(ctx.transmitter_label, "ctx-1");
        assert_eq!(ctx.tags.get("TransmitterLabel"), Some("ctx-1"));
    }

    #[tokio::test]
    async fn unenforce_removes_mark_and_port_immediately() {
        let registry = Arc::new(PuRegistry::new());
        let ctx = PuContext::new("pu-3", None, PuKind::LinuxProcessPu).with_mark(7).with_port(PortSpec::single(443));
        registry.enforce(ctx, None).await;

        registry.unenforce("pu-3").await;

        assert!(registry.lookup_by_mark(7).await.is_none());
        assert!(registry.lookup_by_port(443).await.is_none());
        // contextID lookup still resolves during the grace window.
        assert!(registry.lookup_by_context_id("pu-3").await.is_some());
    }
}
