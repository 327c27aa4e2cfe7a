use std::process::Command;

use tracing::{error, info, warn};

/// Shells out to `sysctl` to put conntrack in the liberal TCP mode the
/// datapath's own handshake rewriting needs: a kernel conntrack that's
/// strict about TCP sequencing will otherwise see our option-injected
/// packets as out of window and drop them. Kept outside `trireme-datapath`
/// since it is host-wide I/O, not per-packet state.
pub struct SystemTuner;

impl SystemTuner {
    /// Sets `net.netfilter.nf_conntrack_tcp_be_liberal=1` (required: the
    /// process aborts if this fails) and `net.ipv4.ip_early_demux=0`
    /// (best-effort: some network namespaces don't expose this knob, so a
    /// failure here is only logged).
    pub fn tune_for_handshake_rewriting() -> Result<(), String> {
        let sysctl = which_sysctl()?;

        run_sysctl(&sysctl, "net.netfilter.nf_conntrack_tcp_be_liberal=1").map_err(|err| {
            error!(%err, "failed to set conntrack options");
            err
        })?;

        if let Err(err) = run_sysctl(&sysctl, "net.ipv4.ip_early_demux=0") {
            warn!(%err, "failed to set early demux options (not present in this network namespace?)");
        }

        info!("system tuned for handshake-piggybacked packet rewriting");
        Ok(())
    }
}

fn which_sysctl() -> Result<String, String> {
    let output = Command::new("which").arg("sysctl").output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err("sysctl command must be installed".to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_sysctl(sysctl: &str, setting: &str) -> Result<(), String> {
    let output = Command::new(sysctl).args(["-w", setting]).output().map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!("`{sysctl} -w {setting}` exited with {}", output.status));
    }
    Ok(())
}
