use std::time::Duration;

/// The handful of deployment-tunable sizes the datapath's packet handling
/// depends on. Populated programmatically; parsing a config file lives
/// outside this crate.
#[derive(Debug, Clone)]
pub struct FilterQueueConfig {
    /// Bytes available for the final-ACK identity token (typically 256-512 B).
    pub ack_size: usize,
    /// MSS ceiling advertised on outbound SYNs once our option is injected.
    pub mss_clamp: u16,
}

impl Default for FilterQueueConfig {
    fn default() -> Self {
        FilterQueueConfig { ack_size: 256, mss_clamp: 1400 }
    }
}

/// Top-level configuration for one `Datapath` instance, reduced to the
/// fields this crate's (non-file-backed) construction path actually needs.
#[derive(Debug, Clone)]
pub struct DatapathConfig {
    pub filter_queue: FilterQueueConfig,
    /// Token claim validity window.
    pub token_validity: Duration,
    /// When an external collaborator (collector, RPC channel, policy
    /// resolver) errors, whether to allow the packet through instead of
    /// dropping it.
    pub fail_open: bool,
    /// Bound on the in-memory flow-record queue.
    pub flow_queue_capacity: usize,
    pub stats_interval: Duration,
    pub user_retention_interval: Duration,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        DatapathConfig {
            filter_queue: FilterQueueConfig::default(),
            token_validity: Duration::from_secs(60),
            fail_open: false,
            flow_queue_capacity: 4096,
            stats_interval: Duration::from_secs(1),
            user_retention_interval: Duration::from_secs(600),
        }
    }
}
