//! Lookup metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless
//! [`install_exporter`] was called. The exporter runs on its own listener
//! because every path on the API router is a lookup route.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::InputMode;

pub const REQUESTS_TOTAL: &str = "lookalike_requests_total";
pub const STAGE_SECONDS: &str = "lookalike_stage_seconds";
pub const RESULTS: &str = "lookalike_results";

/// Start the Prometheus scrape endpoint on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Api(format!("failed to start metrics exporter: {}", e)))?;

    describe_counter!(REQUESTS_TOTAL, Unit::Count, "Lookup requests by input mode and outcome");
    describe_histogram!(STAGE_SECONDS, Unit::Seconds, "Latency of each pipeline stage");
    describe_histogram!(RESULTS, Unit::Count, "Number of links returned per lookup");
    Ok(())
}

/// Count a finished request. `outcome` is `ok` or an error kind name.
pub fn record_request(mode: InputMode, outcome: &'static str) {
    counter!(REQUESTS_TOTAL, "mode" => mode.as_str(), "outcome" => outcome).increment(1);
}

pub fn record_stage(stage: &'static str, elapsed: Duration) {
    histogram!(STAGE_SECONDS, "stage" => stage).record(elapsed.as_secs_f64());
}

pub fn record_results(count: usize) {
    histogram!(RESULTS).record(count as f64);
}
