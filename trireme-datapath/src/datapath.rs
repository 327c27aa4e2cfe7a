use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};
use trireme_packet::{Direction, FiveTuple, IpProto, Packet};

use crate::capture::{CaptureTransport, Verdict};
use crate::clock::Clock;
use crate::collector::{EndpointKind, EventCollector, FlowEndpoint, FlowReporter, FlowRecord};
use crate::config::DatapathConfig;
use crate::conn::{Connection, ConnectionTables, FlowState};
use crate::error::{DatapathError, Result};
use crate::metrics::Metrics;
use crate::plugin::PacketProcessor;
use crate::policy::{Action, FlowPolicy};
use crate::pu::{PuContext, PuRegistry};
use crate::tag::TagStore;
use crate::token::{Secrets, Token, TokenAccessor, SYN_TOKEN_BUDGET};

/// The central orchestrator: owns the connection tables, the PU registry,
/// token signing, and the flow-record reporter, and drives every captured
/// packet through the handshake-piggybacked flow state machine.
pub struct Datapath {
    config: DatapathConfig,
    clock: Arc<dyn Clock>,
    tables: Arc<ConnectionTables>,
    registry: Arc<PuRegistry>,
    token_accessor: Arc<TokenAccessor>,
    reporter: FlowReporter,
    plugin: Option<Arc<dyn PacketProcessor>>,
    metrics: Option<Arc<Metrics>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Datapath {
    pub fn new(
        config: DatapathConfig,
        clock: Arc<dyn Clock>,
        token_accessor: Arc<TokenAccessor>,
        collector: Arc<dyn EventCollector>,
        plugin: Option<Arc<dyn PacketProcessor>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let tables = Arc::new(ConnectionTables::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let reporter = FlowReporter::spawn(collector, config.flow_queue_capacity);
        let datapath = Arc::new(Datapath {
            config,
            clock: clock.clone(),
            tables,
            registry: Arc::new(PuRegistry::new()),
            token_accessor,
            reporter,
            plugin,
            metrics,
            cancel_tx,
            cancel_rx: cancel_rx.clone(),
        });
        datapath.clone().spawn_sweeper(clock, cancel_rx);
        datapath
    }

    /// Runs the background TTL sweep loop; cancellation-safe via
    /// `cancel_rx`. Needs `self` (not just the tables) because a
    /// non-terminal connection timing out has to be reported through the
    /// same registry/reporter/metrics every other drop goes through.
    fn spawn_sweeper(self: Arc<Self>, clock: Arc<dyn Clock>, mut cancel: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ConnectionTables::sweep_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dropped = self.tables.sweep_all(clock.as_ref()).await;
                        self.report_timeout_drops(dropped).await;
                    }
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Registers a PU in the registry and primes the optional
    /// packet-processor plugin with the configured token validity.
    pub async fn enforce(&self, ctx: PuContext, remote_ip: Option<[u8; 4]>) -> Arc<PuContext> {
        if let Some(plugin) = &self.plugin {
            if let Err(err) = plugin.initialize(self.config.token_validity.as_secs()) {
                warn!(%err, "packet processor plugin failed to initialize");
            }
        }
        self.registry.enforce(ctx, remote_ip).await
    }

    pub async fn unenforce(&self, context_id: &str) {
        self.registry.unenforce(context_id).await;
    }

    pub fn update_secrets(&self, secrets: Secrets) {
        self.token_accessor.update_secrets(secrets);
    }

    /// Read access to the connection tables, for callers that need to
    /// observe table occupancy directly (e.g. tests asserting on eviction).
    pub fn tables(&self) -> &ConnectionTables {
        &self.tables
    }

    /// Signals the background sweeper and any `run` loop bound to this
    /// datapath to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Drives one capture transport until it closes or `shutdown` fires.
    /// Cancellation-safe: the `select!` below never leaves a packet
    /// half-processed.
    pub async fn run(&self, transport: &mut dyn CaptureTransport) -> Result<()> {
        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            tokio::select! {
                maybe_packet = transport.recv() => {
                    match maybe_packet {
                        Some((mut buf, mark, direction)) => {
                            let verdict = self.process_packet(&mut buf, mark, direction).await;
                            transport.send_verdict(verdict, buf).await?;
                        }
                        None => break,
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
        transport.close().await;
        Ok(())
    }

    /// The hot-path entry point: parses, dispatches, and reduces every
    /// outcome (success or error) to a single `Verdict` the capture
    /// transport can act on. Errors never propagate past this call: every
    /// drop/accept decision carries through even on a malformed or
    /// unauthorized packet, and a `Transient` failure degrades to
    /// `fail_open` instead of aborting the datapath.
    pub async fn process_packet(&self, buf: &mut [u8], mark: u32, direction: Direction) -> Verdict {
        match self.process_packet_inner(buf, mark, direction).await {
            Ok(verdict) => verdict,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_drop(err.drop_reason());
                }
                if self.config.fail_open && matches!(err, DatapathError::Transient(_)) {
                    Verdict::Accept
                } else {
                    Verdict::Drop
                }
            }
        }
    }

    async fn process_packet_inner(&self, buf: &mut [u8], mark: u32, direction: Direction) -> Result<Verdict> {
        let mut packet = Packet::parse(buf, direction)?;
        match packet.proto() {
            IpProto::Tcp => self.process_tcp(&mut packet, mark, direction).await,
            IpProto::Udp => self.process_udp(&mut packet, mark, direction).await,
        }
    }

    async fn process_tcp(&self, packet: &mut Packet<'_>, mark: u32, direction: Direction) -> Result<Verdict> {
        let flags = packet.flags();
        match (direction, flags.syn(), flags.ack()) {
            (Direction::AppOriginated, true, false) => self.handle_outbound_syn(packet, mark).await,
            (Direction::NetworkOriginated, true, false) => self.handle_inbound_syn(packet).await,
            (Direction::AppOriginated, true, true) => self.handle_outbound_synack(packet).await,
            (Direction::NetworkOriginated, true, true) => self.handle_inbound_synack(packet).await,
            (Direction::AppOriginated, false, true) => self.handle_outbound_ack(packet).await,
            (Direction::NetworkOriginated, false, true) => self.handle_inbound_ack(packet).await,
            // Data/FIN/RST on an already-classified flow: nothing left for the
            // handshake state machine to do, let it through untouched.
            _ => Ok(Verdict::Accept),
        }
    }

    /// The app's outbound SYN: issue a token for the owning PU's tags,
    /// splice it into the option area, clamp MSS, and seed `sourcePort` /
    /// `appOrig`. Traffic with no owning PU (unrecognized mark) is left
    /// alone: this datapath only touches marked traffic.
    async fn handle_outbound_syn(&self, packet: &mut Packet<'_>, mark: u32) -> Result<Verdict> {
        let pu = match self.registry.lookup_by_mark(mark).await {
            Some(pu) => pu,
            None => return Ok(Verdict::Accept),
        };
        let five_tuple = packet.five_tuple();
        let now = self.clock.now();
        let token = self.token_accessor.issue(&pu.tags, now, SYN_TOKEN_BUDGET);

        let mut conn = Connection::new(pu.context_id.clone(), token.nonce, now);
        conn.state = FlowState::SynSent;
        conn.source_identity = Some(pu.tags.clone());

        self.tables.app_orig.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;
        self.tables.source_port.add_or_update((five_tuple.src_addr, five_tuple.src_port), conn.clone(), self.clock.as_ref()).await;

        if let Err(err) = packet.inject_token_option(&token.encode()) {
            conn.state = FlowState::Dropped;
            self.tables.app_orig.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;
            self.tables.source_port.add_or_update((five_tuple.src_addr, five_tuple.src_port), conn, self.clock.as_ref()).await;
            return Err(err.into());
        }
        // MSS clamping is best-effort: a SYN without an MSS option (rare, but
        // legal) simply isn't clamped.
        let _ = packet.clamp_mss(self.config.filter_queue.mss_clamp);
        Ok(Verdict::AcceptModified)
    }

    /// An inbound SYN for a locally-owned port. A miss against the PU
    /// registry means this traffic isn't ours to enforce: record it in
    /// `unknownSyn` and pass it through untouched. A present PU but a
    /// missing or invalid token is `Unauthorized`; policy then runs against
    /// the claimed source tags.
    async fn handle_inbound_syn(&self, packet: &mut Packet<'_>) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        let pu = match self.registry.lookup_by_port(packet.dst_port()).await {
            Some(pu) => pu,
            None => {
                let now = self.clock.now();
                let conn = Connection::new("unknown", [0; 16], now);
                self.tables.unknown_syn.add_or_update(five_tuple, conn, self.clock.as_ref()).await;
                return Ok(Verdict::Accept);
            }
        };

        let now = self.clock.now();
        let (token, source_tags) = match self.verify_inbound_token(packet, &pu, &five_tuple, now, Packet::extract_and_remove_token_option).await {
            Some(result) => result,
            None => return Ok(Verdict::Drop),
        };

        let verdict = pu.policy.evaluate(&source_tags, &pu.tags, Direction::NetworkOriginated);
        if verdict.action == Action::Reject {
            self.report_drop(&pu, &five_tuple, &source_tags, "policy", &verdict).await;
            return Ok(Verdict::Drop);
        }

        let mut conn = Connection::new(pu.context_id.clone(), token.nonce, now);
        conn.state = FlowState::SynReceived;
        conn.source_identity = Some(source_tags);
        conn.verdict = Some(verdict);
        self.tables.net_orig.add_or_update(five_tuple, conn, self.clock.as_ref()).await;
        Ok(Verdict::AcceptModified)
    }

    /// The app's outbound SYN-ACK, answering an inbound SYN recorded under
    /// the reversed tuple in `netOrig`. Embeds a reply token with our own
    /// tags. A tuple with no matching `netOrig` entry (e.g. unknown-SYN
    /// passthrough) is left alone.
    async fn handle_outbound_synack(&self, packet: &mut Packet<'_>) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        let canonical = five_tuple.reversed();
        let mut conn = match self.tables.net_orig.get(&canonical, self.clock.as_ref()).await {
            Some(conn) => conn,
            None => return Ok(Verdict::Accept),
        };
        let pu = match self.registry.lookup_by_context_id(&conn.owner_context_id).await {
            Some(pu) => pu,
            None => {
                self.report_no_context_drop(&five_tuple, &conn.owner_context_id).await;
                return Ok(Verdict::Drop);
            }
        };

        let now = self.clock.now();
        let token = self.token_accessor.issue(&pu.tags, now, SYN_TOKEN_BUDGET);
        conn.touch(now);
        conn.state = FlowState::SynAckSent;
        conn.destination_identity = Some(pu.tags.clone());

        self.tables.app_reply.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;
        self.tables.net_orig.add_or_update(canonical, conn.clone(), self.clock.as_ref()).await;

        if let Err(err) = packet.inject_token_option(&token.encode()) {
            conn.state = FlowState::Dropped;
            self.tables.app_reply.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;
            self.tables.net_orig.add_or_update(canonical, conn, self.clock.as_ref()).await;
            return Err(err.into());
        }
        Ok(Verdict::AcceptModified)
    }

    /// The app's inbound SYN-ACK, matched against the canonical tuple it
    /// was tracked under in `appOrig` since the outbound SYN. This is where
    /// policy actually runs for an app-originated flow: the peer's reply
    /// tags are now known, so the verdict decided here is the one reported.
    async fn handle_inbound_synack(&self, packet: &mut Packet<'_>) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        let canonical = five_tuple.reversed();

        if self.tables.unknown_syn.get(&canonical, self.clock.as_ref()).await.is_some() {
            self.tables.unknown_syn.remove(&canonical).await;
            return Ok(Verdict::Accept);
        }

        let mut conn = match self.tables.app_orig.get(&canonical, self.clock.as_ref()).await {
            Some(conn) => conn,
            None => return Ok(Verdict::Accept),
        };
        let pu = match self.registry.lookup_by_context_id(&conn.owner_context_id).await {
            Some(pu) => pu,
            None => {
                self.report_no_context_drop(&five_tuple, &conn.owner_context_id).await;
                return Ok(Verdict::Drop);
            }
        };

        let now = self.clock.now();
        let destination_tags = match self.verify_inbound_token(packet, &pu, &five_tuple, now, Packet::extract_and_remove_token_option).await {
            Some((_, tags)) => tags,
            None => return Ok(Verdict::Drop),
        };

        let verdict = pu.policy.evaluate(&pu.tags, &destination_tags, Direction::AppOriginated);
        conn.destination_identity = Some(destination_tags.clone());
        conn.verdict = Some(verdict.clone());
        conn.touch(now);

        if verdict.action == Action::Reject {
            conn.state = FlowState::Rejected;
            self.tables.app_orig.remove(&canonical).await;
            self.report_drop(&pu, &five_tuple, &destination_tags, "policy", &verdict).await;
            return Ok(Verdict::Drop);
        }

        conn.state = FlowState::SynAckReceived;
        self.tables.net_reply.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;
        self.tables.app_orig.add_or_update(canonical, conn, self.clock.as_ref()).await;
        Ok(Verdict::AcceptModified)
    }

    /// The app's final ACK, closing the handshake. Carries the larger
    /// `ackSize` token as a payload prefix rather than a TCP option; this
    /// is the only leg of the exchange that needs the bigger budget.
    async fn handle_outbound_ack(&self, packet: &mut Packet<'_>) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        let mut conn = match self.tables.app_orig.get(&five_tuple, self.clock.as_ref()).await {
            Some(conn) if conn.state == FlowState::SynAckReceived => conn,
            _ => return Ok(Verdict::Accept),
        };
        let pu = match self.registry.lookup_by_context_id(&conn.owner_context_id).await {
            Some(pu) => pu,
            None => {
                self.report_no_context_drop(&five_tuple, &conn.owner_context_id).await;
                return Ok(Verdict::Drop);
            }
        };

        let now = self.clock.now();
        let token = self.token_accessor.issue(&pu.tags, now, self.config.filter_queue.ack_size);
        conn.state = FlowState::Established;
        conn.touch(now);
        self.tables.app_orig.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;

        if let Err(err) = packet.inject_tcp_payload_prefix(&token.encode()) {
            conn.state = FlowState::Dropped;
            self.tables.app_orig.add_or_update(five_tuple, conn, self.clock.as_ref()).await;
            return Err(err.into());
        }
        self.report_accept(&pu, &five_tuple, &conn).await;
        Ok(Verdict::AcceptModified)
    }

    /// The network's final ACK, completing the peer's side of the
    /// handshake. Extracts the payload-prefixed token, verifies it, and
    /// transitions `netOrig` straight to `Established` — there is no
    /// further leg to wait on.
    async fn handle_inbound_ack(&self, packet: &mut Packet<'_>) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        let mut conn = match self.tables.net_orig.get(&five_tuple, self.clock.as_ref()).await {
            Some(conn) if conn.state == FlowState::SynAckSent => conn,
            _ => return Ok(Verdict::Accept),
        };
        let pu = match self.registry.lookup_by_context_id(&conn.owner_context_id).await {
            Some(pu) => pu,
            None => {
                self.report_no_context_drop(&five_tuple, &conn.owner_context_id).await;
                return Ok(Verdict::Drop);
            }
        };

        let now = self.clock.now();
        let source_tags = match self.verify_inbound_token(packet, &pu, &five_tuple, now, Packet::extract_and_remove_tcp_payload_prefix).await {
            Some((_, tags)) => tags,
            None => return Ok(Verdict::Drop),
        };

        conn.source_identity = Some(source_tags);
        conn.state = FlowState::Established;
        conn.touch(now);
        self.tables.net_orig.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;

        self.report_accept(&pu, &five_tuple, &conn).await;
        Ok(Verdict::AcceptModified)
    }

    async fn process_udp(&self, packet: &mut Packet<'_>, mark: u32, direction: Direction) -> Result<Verdict> {
        match direction {
            Direction::AppOriginated => self.handle_udp_outbound(packet, mark).await,
            Direction::NetworkOriginated => self.handle_udp_inbound(packet).await,
        }
    }

    /// UDP has no handshake to piggyback on, so the first datagram in each
    /// direction carries the identity token once (see `packet.rs`'s
    /// `inject_udp_token`); every later datagram on an already-`Established`
    /// flow passes straight through.
    async fn handle_udp_outbound(&self, packet: &mut Packet<'_>, mark: u32) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        if let Some(conn) = self.tables.app_orig.get(&five_tuple, self.clock.as_ref()).await {
            if conn.state == FlowState::Established {
                return Ok(Verdict::Accept);
            }
        }
        let pu = match self.registry.lookup_by_mark(mark).await {
            Some(pu) => pu,
            None => return Ok(Verdict::Accept),
        };
        let now = self.clock.now();
        let token = self.token_accessor.issue(&pu.tags, now, SYN_TOKEN_BUDGET);
        let mut conn = Connection::new(pu.context_id.clone(), token.nonce, now);
        conn.state = FlowState::Established;
        conn.source_identity = Some(pu.tags.clone());
        self.tables.app_orig.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;

        if let Err(err) = packet.inject_udp_token(&token.encode()) {
            conn.state = FlowState::Dropped;
            self.tables.app_orig.add_or_update(five_tuple, conn, self.clock.as_ref()).await;
            return Err(err.into());
        }
        Ok(Verdict::AcceptModified)
    }

    async fn handle_udp_inbound(&self, packet: &mut Packet<'_>) -> Result<Verdict> {
        let five_tuple = packet.five_tuple();
        if let Some(conn) = self.tables.net_orig.get(&five_tuple, self.clock.as_ref()).await {
            if conn.state == FlowState::Established {
                return Ok(Verdict::Accept);
            }
        }
        let pu = match self.registry.lookup_by_port(packet.dst_port()).await {
            Some(pu) => pu,
            None => return Ok(Verdict::Accept),
        };

        let now = self.clock.now();
        let (token, source_tags) = match self.verify_inbound_token(packet, &pu, &five_tuple, now, Packet::extract_and_remove_udp_token).await {
            Some(result) => result,
            None => return Ok(Verdict::Drop),
        };

        let verdict = pu.policy.evaluate(&source_tags, &pu.tags, Direction::NetworkOriginated);
        if verdict.action == Action::Reject {
            self.report_drop(&pu, &five_tuple, &source_tags, "policy", &verdict).await;
            return Ok(Verdict::Drop);
        }

        let mut conn = Connection::new(pu.context_id.clone(), token.nonce, now);
        conn.state = FlowState::Established;
        conn.source_identity = Some(source_tags);
        conn.verdict = Some(verdict);
        self.tables.net_orig.add_or_update(five_tuple, conn.clone(), self.clock.as_ref()).await;

        self.report_accept(&pu, &five_tuple, &conn).await;
        Ok(Verdict::AcceptModified)
    }

    /// A flow whose owning PU has vanished from the registry (Unenforced
    /// past its 10 s grace window) has no `PuContext` left to build a
    /// normal flow record from. Report it anyway under the connection's
    /// last-known contextID so the drop is never silent.
    async fn report_no_context_drop(&self, tuple: &FiveTuple, context_id: &str) {
        let record = FlowRecord {
            context_id: context_id.to_string(),
            source: FlowEndpoint { id: context_id.to_string(), ip: tuple.src_addr, port: tuple.src_port, kind: EndpointKind::ProcessingUnit },
            destination: FlowEndpoint { id: "external".to_string(), ip: tuple.dst_addr, port: tuple.dst_port, kind: EndpointKind::ExternalIp },
            tags: Vec::new(),
            action: Action::Reject,
            drop_reason: Some("no-context"),
            policy_id: "no-context".to_string(),
            l4_protocol: tuple.proto,
            observed_action: None,
            observed_policy_id: None,
        };
        self.submit(record);
        if let Some(metrics) = &self.metrics {
            metrics.record_drop("no-context");
        }
    }

    /// A connection swept out of `appOrig`/`netOrig` while still half-open:
    /// the handshake never reached a terminal state before its TTL ran out.
    /// Reported exactly like any other drop, under the same `"tcp-data"`
    /// reason the table-full/queue-full `Transient` cases use, since this
    /// is the same family of failure (the table losing the flow, not the
    /// peer or policy rejecting it).
    async fn report_timeout_drops(&self, dropped: Vec<(FiveTuple, Connection)>) {
        for (tuple, conn) in dropped {
            match self.registry.lookup_by_context_id(&conn.owner_context_id).await {
                Some(pu) => {
                    let peer_tags = conn.destination_identity.as_ref().or(conn.source_identity.as_ref()).cloned().unwrap_or_default();
                    let verdict = conn.verdict.clone().unwrap_or_else(FlowPolicy::accept_all);
                    self.report_drop(&pu, &tuple, &peer_tags, "tcp-data", &verdict).await;
                }
                None => {
                    self.report_no_context_drop(&tuple, &conn.owner_context_id).await;
                }
            }
        }
    }

    /// Extracts, decodes, and verifies an inbound identity token in one
    /// step. A failure at any of the three stages is reported immediately
    /// under reason `"auth"` rather than bubbling up as a `DatapathError`
    /// for the generic post-hoc catch in `process_packet` to count and
    /// nothing else.
    async fn verify_inbound_token(
        &self,
        packet: &mut Packet<'_>,
        pu: &PuContext,
        tuple: &FiveTuple,
        now: std::time::Instant,
        extract: impl FnOnce(&mut Packet<'_>) -> trireme_packet::Result<Vec<u8>>,
    ) -> Option<(Token, TagStore)> {
        let token = match extract(packet).ok().and_then(|bytes| Token::decode(&bytes).ok()) {
            Some(token) => token,
            None => {
                self.report_auth_drop(pu, tuple).await;
                return None;
            }
        };
        match self.token_accessor.verify(&token, now) {
            Ok(tags) => Some((token, tags)),
            Err(_) => {
                self.report_auth_drop(pu, tuple).await;
                None
            }
        }
    }

    /// A token that fails to extract, decode, or verify: same "always
    /// report" treatment as a policy reject, under reason `"auth"`. There
    /// is no verdict to carry (policy never ran), so the record is built
    /// against an accept-all placeholder rather than `build_flow_record`.
    async fn report_auth_drop(&self, pu: &PuContext, tuple: &FiveTuple) {
        let verdict = FlowPolicy::accept_all();
        let record = self.build_flow_record(pu, tuple, &TagStore::new(), Action::Reject, Some("auth"), &verdict);
        self.submit(record);
        if let Some(metrics) = &self.metrics {
            metrics.record_drop("auth");
        }
    }

    async fn report_drop(&self, pu: &PuContext, tuple: &FiveTuple, peer_tags: &TagStore, reason: &'static str, verdict: &FlowPolicy) {
        let record = self.build_flow_record(pu, tuple, peer_tags, Action::Reject, Some(reason), verdict);
        self.submit(record);
        if let Some(metrics) = &self.metrics {
            metrics.record_drop(reason);
        }
    }

    async fn report_accept(&self, pu: &PuContext, tuple: &FiveTuple, conn: &Connection) {
        let verdict = conn.verdict.clone().unwrap_or_else(FlowPolicy::accept_all);
        let peer_tags = conn.destination_identity.as_ref().or(conn.source_identity.as_ref()).cloned().unwrap_or_default();
        let record = self.build_flow_record(pu, tuple, &peer_tags, Action::Accept, None, &verdict);
        self.submit(record);
        if let Some(metrics) = &self.metrics {
            metrics.flows_accepted_total.add(1, &[]);
        }
    }

    fn build_flow_record(&self, pu: &PuContext, tuple: &FiveTuple, peer_tags: &TagStore, action: Action, drop_reason: Option<&'static str>, verdict: &FlowPolicy) -> FlowRecord {
        FlowRecord {
            context_id: pu.context_id.clone(),
            source: FlowEndpoint { id: pu.context_id.clone(), ip: tuple.src_addr, port: tuple.src_port, kind: EndpointKind::ProcessingUnit },
            destination: FlowEndpoint {
                id: peer_tags.get("TransmitterLabel").unwrap_or("external").to_string(),
                ip: tuple.dst_addr,
                port: tuple.dst_port,
                kind: EndpointKind::ProcessingUnit,
            },
            tags: pu.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect(),
            action,
            drop_reason,
            policy_id: verdict.policy_id.clone(),
            l4_protocol: tuple.proto,
            observed_action: verdict.shadow.as_ref().map(|s| s.action),
            observed_policy_id: verdict.shadow.as_ref().map(|s| s.policy_id.clone()),
        }
    }

    fn submit(&self, record: FlowRecord) {
        if !self.reporter.report(record) {
            debug!("flow record queue full, dropping oldest record");
            if let Some(metrics) = &self.metrics {
                metrics.flow_queue_overflow_total.add(1, &[]);
            }
        }
    }
}
