use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHasher};
use tokio::sync::RwLock;
use trireme_packet::FiveTuple;

use crate::clock::Clock;
use crate::policy::FlowPolicy;
use crate::tag::TagStore;

const NUM_SHARDS: usize = 16;
const APP_NET_TTL: Duration = Duration::from_secs(24);
const UNKNOWN_SYN_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Start,
    SynSent,
    SynReceived,
    SynAckSent,
    SynAckReceived,
    AckSent,
    Established,
    Rejected,
    Dropped,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Established | FlowState::Rejected | FlowState::Dropped)
    }
}

/// Per-flow state keyed by a canonical 5-tuple, independent of which
/// connection table it currently lives in.
#[derive(Debug, Clone)]
pub struct Connection {
    pub state: FlowState,
    pub owner_context_id: String,
    pub source_identity: Option<TagStore>,
    pub destination_identity: Option<TagStore>,
    pub verdict: Option<FlowPolicy>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub nonce: [u8; 16],
    /// Opaque bag external packet processors (see `plugin.rs`) can stash
    /// data in; the datapath never interprets its contents.
    pub service_data: AHashMap<String, Vec<u8>>,
}

impl Connection {
    pub fn new(owner_context_id: impl Into<String>, nonce: [u8; 16], now: Instant) -> Self {
        Connection {
            state: FlowState::Start,
            owner_context_id: owner_context_id.into(),
            source_identity: None,
            destination_identity: None,
            verdict: None,
            created_at: now,
            last_activity: now,
            nonce,
            service_data: AHashMap::new(),
        }
    }

    /// Stamps last-activity with the clock reading taken at the *start* of
    /// processing this packet, never with a fresh `now()` read after doing
    /// work.
    pub fn touch(&mut self, processing_started_at: Instant) {
        self.last_activity = processing_started_at;
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A hash map sharded across `NUM_SHARDS` independently-locked buckets, so
/// packet processing on different flows never contends on the same lock.
pub struct ShardedTable<K, V> {
    shards: Vec<RwLock<AHashMap<K, Entry<V>>>>,
    ttl: Duration,
}

impl<K, V> ShardedTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        let shards = (0..NUM_SHARDS).map(|_| RwLock::new(AHashMap::new())).collect();
        ShardedTable { shards, ttl }
    }

    fn shard_for(&self, key: &K) -> &RwLock<AHashMap<K, Entry<V>>> {
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Returns a clone of the live value on a hit, `None` on a miss or an
    /// expired entry. Never holds the shard lock past this call; callers
    /// run verification/policy evaluation on the returned copy and write it
    /// back with `add_or_update`.
    pub async fn get(&self, key: &K, clock: &dyn Clock) -> Option<V> {
        let shard = self.shard_for(key).read().await;
        shard.get(key).filter(|e| e.expires_at > clock.now()).map(|e| e.value.clone())
    }

    /// Atomic upsert: returns the live value (existing or freshly created)
    /// and whether this call created it.
    pub async fn get_or_create(&self, key: K, clock: &dyn Clock, make: impl FnOnce() -> V) -> (V, bool) {
        let mut shard = self.shard_for(&key).write().await;
        if let Some(entry) = shard.get(&key) {
            if entry.expires_at > clock.now() {
                return (entry.value.clone(), false);
            }
        }
        let value = make();
        shard.insert(key, Entry { value: value.clone(), expires_at: clock.now() + self.ttl });
        (value, true)
    }

    pub async fn add_or_update(&self, key: K, value: V, clock: &dyn Clock) {
        let mut shard = self.shard_for(&key).write().await;
        shard.insert(key, Entry { value, expires_at: clock.now() + self.ttl });
    }

    pub async fn remove(&self, key: &K) {
        self.shard_for(key).write().await.remove(key);
    }

    /// Evicts every expired entry and hands the caller back its key/value,
    /// so a table whose `V` carries a state machine can react to the
    /// eviction instead of losing it silently.
    pub async fn sweep(&self, clock: &dyn Clock) -> Vec<(K, V)> {
        let now = clock.now();
        let mut evicted = Vec::new();
        for shard_lock in &self.shards {
            let mut shard = shard_lock.write().await;
            let expired_keys: Vec<K> = shard.iter().filter(|(_, e)| e.expires_at <= now).map(|(k, _)| k.clone()).collect();
            for key in expired_keys {
                if let Some(entry) = shard.remove(&key) {
                    evicted.push((key, entry.value));
                }
            }
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }
}

impl<K, V> ShardedTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn remove_with_delay(self: &Arc<Self>, key: K, delay: Duration) {
        let table = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            table.remove(&key).await;
        });
    }
}

pub type SourcePortKey = ([u8; 4], u16);

/// The six connection tables that drive handshake dispatch, each
/// independently TTL'd and sharded.
pub struct ConnectionTables {
    pub source_port: ShardedTable<SourcePortKey, Connection>,
    pub app_orig: ShardedTable<FiveTuple, Connection>,
    pub app_reply: ShardedTable<FiveTuple, Connection>,
    pub net_orig: ShardedTable<FiveTuple, Connection>,
    pub net_reply: ShardedTable<FiveTuple, Connection>,
    pub unknown_syn: ShardedTable<FiveTuple, Connection>,
}

impl Default for ConnectionTables {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTables {
    pub fn new() -> Self {
        ConnectionTables {
            source_port: ShardedTable::new(APP_NET_TTL),
            app_orig: ShardedTable::new(APP_NET_TTL),
            app_reply: ShardedTable::new(APP_NET_TTL),
            net_orig: ShardedTable::new(APP_NET_TTL),
            net_reply: ShardedTable::new(APP_NET_TTL),
            unknown_syn: ShardedTable::new(UNKNOWN_SYN_TTL),
        }
    }

    /// The background sweep frequency: at most the minimum TTL divided by
    /// four.
    pub fn sweep_interval() -> Duration {
        UNKNOWN_SYN_TTL / 4
    }

    /// Evicts expired entries from every table. `appOrig`/`netOrig` are the
    /// tables a flow is tracked under from its own initiating leg onward, so
    /// a still-half-open (non-terminal) entry timing out there is reported
    /// as a timeout drop and stamped `Dropped` on its way out. `appReply`/
    /// `netReply`/`sourcePort` mirror the same flow and `unknownSyn` was
    /// never owned by an enforced PU to begin with, so their expiries are
    /// silent.
    pub async fn sweep_all(&self, clock: &dyn Clock) -> Vec<(FiveTuple, Connection)> {
        self.source_port.sweep(clock).await;
        let mut dropped = Vec::new();
        for (tuple, mut conn) in self.app_orig.sweep(clock).await {
            if !conn.state.is_terminal() {
                conn.state = FlowState::Dropped;
                dropped.push((tuple, conn));
            }
        }
        self.app_reply.sweep(clock).await;
        for (tuple, mut conn) in self.net_orig.sweep(clock).await {
            if !conn.state.is_terminal() {
                conn.state = FlowState::Dropped;
                dropped.push((tuple, conn));
            }
        }
        self.net_reply.sweep(clock).await;
        self.unknown_syn.sweep(clock).await;
        dropped
    }
}
