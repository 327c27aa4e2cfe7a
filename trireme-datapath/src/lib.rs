#![forbid(unsafe_code)]

mod capture;
mod clock;
mod collector;
mod config;
mod conn;
mod datapath;
mod error;
mod metrics;
mod plugin;
mod policy;
mod pu;
mod stats;
mod tag;
mod token;

pub use capture::{CaptureTransport, Verdict};
#[cfg(any(test, feature = "test-support"))]
pub use capture::testing::ChannelTransport;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use collector::{EndpointKind, EventCollector, FlowEndpoint, FlowReporter, FlowRecord, InMemoryCollector, UserRecord};
pub use config::{DatapathConfig, FilterQueueConfig};
pub use conn::{Connection, ConnectionTables, FlowState};
pub use datapath::Datapath;
pub use error::{DatapathError, Result, TokenError};
pub use metrics::{init_metrics, Metrics};
pub use plugin::PacketProcessor;
pub use policy::{Action, FlowPolicy, ObserveAction, PolicyDb, PolicyRule, ShadowPolicy};
pub use pu::{PortSpec, PuContext, PuKind, PuRegistry};
pub use stats::{RpcTransport, StatsExporter, UnixSocketStatsTransport};
pub use tag::{Tag, TagStore};
pub use token::{Claims, Secrets, SigningMode, Token, TokenAccessor, SYN_TOKEN_BUDGET};
