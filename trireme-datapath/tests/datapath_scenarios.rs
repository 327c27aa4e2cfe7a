#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use trireme_datapath::{
    Action, ChannelTransport, DatapathConfig, Datapath, EventCollector, InMemoryCollector, ManualClock, PolicyDb, PortSpec, PuContext,
    PuKind, Secrets, TokenAccessor, Verdict,
};
use trireme_packet::Direction;

fn build_datapath(clock: Arc<ManualClock>) -> Arc<Datapath> {
    let token_accessor = Arc::new(TokenAccessor::new(Secrets::Psk(b"shared-secret".to_vec()), Duration::from_secs(60)));
    let collector = Arc::new(InMemoryCollector::new(64));
    Datapath::new(DatapathConfig::default(), clock, token_accessor, collector, None, None)
}

fn bare_segment(src_addr: [u8; 4], dst_addr: [u8; 4], src_port: u16, dst_port: u16, flags: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    buf[0] = 0x45;
    buf[9] = 6;
    let total_len: u16 = 44;
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[12..16].copy_from_slice(&src_addr);
    buf[16..20].copy_from_slice(&dst_addr);
    let l4 = 20;
    buf[l4..l4 + 2].copy_from_slice(&src_port.to_be_bytes());
    buf[l4 + 2..l4 + 4].copy_from_slice(&dst_port.to_be_bytes());
    buf[l4 + 12] = 6 << 4;
    buf[l4 + 13] = flags;
    buf[l4 + 20] = 2;
    buf[l4 + 21] = 4;
    buf[l4 + 22..l4 + 24].copy_from_slice(&1460u16.to_be_bytes());
    buf.truncate(44);
    buf.resize(256, 0);
    buf
}

fn bare_syn(src_port: u16, dst_port: u16) -> Vec<u8> {
    bare_segment([10, 0, 0, 1], [10, 0, 0, 2], src_port, dst_port, 0x02)
}

#[tokio::test]
async fn outbound_syn_from_unknown_mark_passes_through_untouched() {
    let clock = Arc::new(ManualClock::new());
    let datapath = build_datapath(clock);
    let mut buf = bare_syn(40000, 443);
    let verdict = datapath.process_packet(&mut buf, 999, Direction::AppOriginated).await;
    assert_eq!(verdict, Verdict::Accept);
}

#[tokio::test]
async fn outbound_syn_from_known_mark_injects_token() {
    let clock = Arc::new(ManualClock::new());
    let datapath = build_datapath(clock);
    let ctx = PuContext::new("client", None, PuKind::LinuxProcessPu).with_mark(7).with_policy(PolicyDb::with_allow_all());
    datapath.enforce(ctx, None).await;

    let mut buf = bare_syn(40000, 443);
    let verdict = datapath.process_packet(&mut buf, 7, Direction::AppOriginated).await;
    assert_eq!(verdict, Verdict::AcceptModified);
    // total length grew past the bare 44-byte SYN once the token option landed.
    assert!(buf[2] as u16 * 256 + buf[3] as u16 > 44);
}

#[tokio::test]
async fn inbound_syn_with_no_owning_pu_is_recorded_unknown_and_passed_through() {
    let clock = Arc::new(ManualClock::new());
    let datapath = build_datapath(clock);
    let mut buf = bare_syn(40000, 51234);
    let verdict = datapath.process_packet(&mut buf, 0, Direction::NetworkOriginated).await;
    assert_eq!(verdict, Verdict::Accept);
    assert_eq!(datapath.tables().unknown_syn.len().await, 1);
}

#[tokio::test]
async fn inbound_syn_without_a_token_is_rejected_as_unauthorized() {
    let clock = Arc::new(ManualClock::new());
    let datapath = build_datapath(clock);
    let ctx = PuContext::new("server", None, PuKind::LinuxProcessPu).with_port(PortSpec::single(443)).with_policy(PolicyDb::with_allow_all());
    datapath.enforce(ctx, None).await;

    let mut buf = bare_syn(40000, 443);
    let verdict = datapath.process_packet(&mut buf, 0, Direction::NetworkOriginated).await;
    assert_eq!(verdict, Verdict::Drop);
}

#[tokio::test]
async fn run_drains_the_transport_until_it_closes() {
    let clock = Arc::new(ManualClock::new());
    let datapath = build_datapath(clock);
    let buf = bare_syn(40000, 51234);
    let mut transport = ChannelTransport::new(vec![(buf, 0, Direction::NetworkOriginated)]);

    datapath.run(&mut transport).await.unwrap();

    assert_eq!(transport.verdicts.len(), 1);
    assert!(transport.closed);
}

/// A PU unenforced mid-flow stays resolvable for its 10 s grace window,
/// then a subsequent packet for that flow is dropped with
/// DropReason="no-context" — and that drop is never silent: it still
/// produces a flow record and a counter bump.
#[tokio::test(start_paused = true)]
async fn synack_after_unenforce_grace_window_reports_no_context_drop() {
    let clock = Arc::new(ManualClock::new());
    let token_accessor = Arc::new(TokenAccessor::new(Secrets::Psk(b"shared-secret".to_vec()), Duration::from_secs(60)));
    let collector = Arc::new(InMemoryCollector::new(64));
    let datapath = Datapath::new(DatapathConfig::default(), clock, token_accessor, collector.clone(), None, None);

    let ctx = PuContext::new("server", None, PuKind::LinuxProcessPu).with_port(PortSpec::single(443)).with_policy(PolicyDb::with_allow_all());
    datapath.enforce(ctx, None).await;

    let mut syn_buf = bare_segment([10, 0, 0, 1], [10, 0, 0, 2], 40000, 443, 0x02);
    let verdict = datapath.process_packet(&mut syn_buf, 0, Direction::NetworkOriginated).await;
    assert_eq!(verdict, Verdict::AcceptModified);

    datapath.unenforce("server").await;
    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;

    let mut synack_buf = bare_segment([10, 0, 0, 2], [10, 0, 0, 1], 443, 40000, 0x12);
    let verdict = datapath.process_packet(&mut synack_buf, 0, Direction::AppOriginated).await;
    assert_eq!(verdict, Verdict::Drop);

    tokio::task::yield_now().await;
    let records = collector.get_all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].drop_reason, Some("no-context"));
    assert_eq!(records[0].action, Action::Reject);
}

/// An inbound SYN with no (or an invalid) identity token is dropped
/// immediately and still produces a reported record with reason `"auth"`,
/// the same treatment a policy reject gets.
#[tokio::test]
async fn inbound_syn_without_a_token_reports_auth_drop() {
    let clock = Arc::new(ManualClock::new());
    let token_accessor = Arc::new(TokenAccessor::new(Secrets::Psk(b"shared-secret".to_vec()), Duration::from_secs(60)));
    let collector = Arc::new(InMemoryCollector::new(64));
    let datapath = Datapath::new(DatapathConfig::default(), clock, token_accessor, collector.clone(), None, None);

    let ctx = PuContext::new("server", None, PuKind::LinuxProcessPu).with_port(PortSpec::single(443)).with_policy(PolicyDb::with_allow_all());
    datapath.enforce(ctx, None).await;

    let mut buf = bare_syn(40000, 443);
    let verdict = datapath.process_packet(&mut buf, 0, Direction::NetworkOriginated).await;
    assert_eq!(verdict, Verdict::Drop);

    tokio::task::yield_now().await;
    let records = collector.get_all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].drop_reason, Some("auth"));
    assert_eq!(records[0].action, Action::Reject);
}

/// A half-open connection (SYN sent, never ACKed) ages out of `appOrig` via
/// the background sweep rather than being silently dropped from the table:
/// it is reported with reason `"tcp-data"`, the same the `Transient`
/// table-pressure cases use.
#[tokio::test(start_paused = true)]
async fn half_open_connection_times_out_and_reports_it() {
    let clock = Arc::new(ManualClock::new());
    let token_accessor = Arc::new(TokenAccessor::new(Secrets::Psk(b"shared-secret".to_vec()), Duration::from_secs(60)));
    let collector = Arc::new(InMemoryCollector::new(64));
    let datapath = Datapath::new(DatapathConfig::default(), clock.clone(), token_accessor, collector.clone(), None, None);

    let ctx = PuContext::new("client", None, PuKind::LinuxProcessPu).with_mark(7).with_policy(PolicyDb::with_allow_all());
    datapath.enforce(ctx, None).await;

    let mut syn_buf = bare_syn(40000, 443);
    let verdict = datapath.process_packet(&mut syn_buf, 7, Direction::AppOriginated).await;
    assert_eq!(verdict, Verdict::AcceptModified);

    clock.advance(Duration::from_secs(25));
    tokio::time::advance(Duration::from_secs(25)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(datapath.tables().app_orig.len().await, 0);
    let records = collector.get_all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].drop_reason, Some("tcp-data"));
    assert_eq!(records[0].action, Action::Reject);
}
