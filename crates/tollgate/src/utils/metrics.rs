use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::info;

/// Serve Prometheus metrics on `port`; `bind_address` falls back to all
/// interfaces when it is not an IP.
pub fn init_metrics(bind_address: &str, port: u16) -> Result<(), BuildError> {
    let ip: IpAddr = bind_address
        .parse()
        .unwrap_or(IpAddr::from([0, 0, 0, 0]));
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(ip, port))
        .add_global_label("service", "tollgate")
        .install()?;

    info!(port, "metrics exporter listening on /metrics");
    Ok(())
}

pub fn track_request(listener: &'static str, status: u16, elapsed: Duration) {
    let status = status.to_string();
    counter!("http_requests_total", "listener" => listener, "status" => status.clone()).increment(1);
    histogram!("http_request_duration_seconds", "listener" => listener, "status" => status)
        .record(elapsed.as_secs_f64());
}
