use std::io;
use std::net::SocketAddr;
use std::sync::Once;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// A single global recorder, no matter how many times init is called.
static INIT: Once = Once::new();

/// Install a Prometheus exporter serving `/metrics` on `bind_addr`.
///
/// Repeated calls after the first successful installation are no-ops.
pub fn init_metrics(bind_addr: SocketAddr) -> io::Result<()> {
    let mut init_result: io::Result<()> = Ok(());

    INIT.call_once(|| {
        let builder = PrometheusBuilder::new().with_http_listener(bind_addr);

        if let Err(err) = builder.install() {
            init_result = Err(io::Error::new(
                io::ErrorKind::Other,
                format!("failed to init metrics: {err}"),
            ));
        }
    });

    init_result
}

/// Increment a counter. `name` must be `'static` (call sites use literals).
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a histogram sample. `name` must be `'static`.
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}
