use std::sync::Arc;

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

/// The datapath's Prometheus-backed counters. Scoped down from
/// `telemetry::metrics::Metrics` (HTTP connection/fingerprinting counters)
/// to what this datapath needs: per-`DropReason` drop counts, flow-record
/// queue overflow, and token verification failures. No metrics HTTP
/// endpoint is built here; see DESIGN.md's dropped-dependency list for why
/// `hyper` didn't carry over. A caller that needs to expose `registry`
/// over HTTP wires its own listener around it.
#[derive(Clone)]
pub struct Metrics {
    pub flows_accepted_total: Counter<u64>,
    pub flows_dropped_total: Counter<u64>,
    pub flow_queue_overflow_total: Counter<u64>,
    pub token_verify_failures_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: Meter) -> Self {
        Metrics {
            flows_accepted_total: meter
                .u64_counter("trireme_flows_accepted_total")
                .with_description("Total number of flows admitted by the policy evaluator")
                .build(),
            flows_dropped_total: meter
                .u64_counter("trireme_flows_dropped_total")
                .with_description("Total number of flows dropped, labeled by drop reason")
                .build(),
            flow_queue_overflow_total: meter
                .u64_counter("trireme_flow_queue_overflow_total")
                .with_description("Total number of flow records dropped due to a full reporter queue")
                .build(),
            token_verify_failures_total: meter
                .u64_counter("trireme_token_verify_failures_total")
                .with_description("Total number of identity token verification failures")
                .build(),
        }
    }

    pub fn record_drop(&self, reason: &'static str) {
        self.flows_dropped_total.add(1, &[KeyValue::new("reason", reason)]);
    }
}

pub fn init_metrics() -> Result<(Arc<Metrics>, Registry), Box<dyn std::error::Error + Send + Sync>> {
    let registry = Registry::default();

    let exporter = opentelemetry_prometheus::exporter().with_registry(registry.clone()).build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider);

    let meter = global::meter("trireme-datapath");
    Ok((Arc::new(Metrics::new(meter)), registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_metrics_builds_a_usable_registry() {
        let (metrics, registry) = init_metrics().unwrap();
        metrics.record_drop("policy");
        metrics.flow_queue_overflow_total.add(1, &[]);
        // A populated registry gathers at least the families we registered.
        assert!(!registry.gather().is_empty());
    }
}
