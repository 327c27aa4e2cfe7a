#![forbid(unsafe_code)]

mod system_tuner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trireme_datapath::{
    init_metrics, CaptureTransport, Datapath, DatapathConfig, InMemoryCollector, Secrets, StatsExporter, TokenAccessor,
    UnixSocketStatsTransport, Verdict,
};
use trireme_packet::Direction;
use trireme_tc::{install, ClassifierParams, ClassifierProgram, ShellExecutor};

use system_tuner::SystemTuner;

/// Placeholder for the packet source this crate does not implement:
/// capture (an NFQUEUE or TUN-device attachment) is a deployment-specific
/// collaborator the datapath only depends on through the `CaptureTransport`
/// trait. `recv` never resolves; the surrounding `Datapath::run` select
/// loop still reacts promptly to `shutdown()` because that's a separate
/// branch of the same `select!`.
struct NoCaptureSourceConfigured;

#[async_trait]
impl CaptureTransport for NoCaptureSourceConfigured {
    async fn recv(&mut self) -> Option<(Vec<u8>, u32, Direction)> {
        std::future::pending().await
    }

    async fn send_verdict(&mut self, _verdict: Verdict, _buf: Vec<u8>) -> trireme_datapath::Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = SystemTuner::tune_for_handshake_rewriting() {
        error!(%err, "failed to tune host networking for handshake rewriting");
        std::process::exit(1);
    }

    let token_accessor = Arc::new(TokenAccessor::new(load_secrets(), Duration::from_secs(60)));
    let collector = Arc::new(InMemoryCollector::new(4096));
    let metrics = match init_metrics() {
        Ok((metrics, _registry)) => Some(metrics),
        Err(err) => {
            warn!(%err, "metrics exporter did not initialize, continuing without it");
            None
        }
    };

    let datapath = Datapath::new(DatapathConfig::default(), Arc::new(trireme_datapath::MonotonicClock), token_accessor, collector.clone(), None, metrics);

    if let Err(err) = install_classifier(std::env::var("TRIREME_DEVICE").unwrap_or_else(|_| "eth0".to_string())) {
        warn!(%err, "traffic classifier install failed, continuing without queue steering");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let stats_handle = UnixSocketStatsTransport::from_env().ok().map(|transport| {
        let exporter = StatsExporter::new(collector, Arc::new(transport), Duration::from_secs(1), Duration::from_secs(600));
        tokio::spawn(exporter.run(shutdown_rx.clone()))
    });
    if stats_handle.is_none() {
        info!("STATS_CHANNEL_PATH/STATS_SECRET not set, statistics export disabled");
    }

    let mut transport = NoCaptureSourceConfigured;
    let datapath_for_signals = datapath.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        datapath_for_signals.shutdown();
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = datapath.run(&mut transport).await {
        error!(%err, "datapath exited with error");
        std::process::exit(1);
    }
    info!("datapath shut down cleanly");
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(%err, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}

fn install_classifier(device: String) -> Result<(), trireme_tc::TcError> {
    let params = ClassifierParams { device, num_queues: 4, cgroup_high_bit: 1, cgroup_start_mark: 0x100 };
    let input = ClassifierProgram::build_input(&params)?;
    let output = ClassifierProgram::build_output(&params)?;
    let executor = ShellExecutor;
    install(&executor, &input)?;
    install(&executor, &output)?;
    Ok(())
}

/// Reads PSK key material from `TRIREME_PSK`; a file- or orchestrator-backed
/// secrets distribution channel is out of scope for this binary.
fn load_secrets() -> Secrets {
    match std::env::var("TRIREME_PSK") {
        Ok(psk) => Secrets::Psk(psk.into_bytes()),
        Err(_) => {
            warn!("TRIREME_PSK not set, generating an ephemeral key (tokens will not verify across restarts)");
            use rand::RngCore;
            let mut key = vec![0u8; 32];
            rand::rng().fill_bytes(&mut key);
            Secrets::Psk(key)
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}
