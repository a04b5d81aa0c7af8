use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port of the Prometheus scrape endpoint.
pub const METRICS_PORT: u16 = 9000;

/// Installs the global metrics recorder and serves it on `[::]:9000/metrics`.
///
/// `instance` is attached as a global `instance` label when given, so several replicators
/// can be scraped into the same Prometheus.
pub fn init_metrics(instance: Option<&str>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        METRICS_PORT,
    ));

    if let Some(instance) = instance {
        builder = builder.add_global_label("instance", instance);
    }

    builder.install()?;

    Ok(())
}
