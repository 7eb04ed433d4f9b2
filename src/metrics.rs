//! Prometheus metrics (`metrics` feature) and tracing spans (`tracing` feature).

#[cfg(feature = "metrics")]
pub use prom::{SeedkeeperMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prom {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider, UpDownCounter};
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<SeedkeeperMetrics> = Lazy::new(SeedkeeperMetrics::init);

    pub struct SeedkeeperMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub acquire_wait: Histogram<f64>,
        pub connections_opened_total: Counter<u64>,
        pub connections_closed_total: Counter<u64>,
        pub connections_open: UpDownCounter<i64>,
        pub stream_rows_total: Counter<u64>,
    }

    impl SeedkeeperMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
                .expect("failed to build prometheus exporter");
            let provider = SdkMeterProvider::builder().with_reader(exporter).build();
            let meter = provider.meter("seedkeeper");

            let queries_total = meter
                .u64_counter("seedkeeper_queries_total")
                .with_description("Total statements executed")
                .build();
            let query_errors_total = meter
                .u64_counter("seedkeeper_query_errors_total")
                .with_description("Statements that failed to prepare, execute or fetch")
                .build();
            let query_duration = meter
                .f64_histogram("seedkeeper_query_duration_seconds")
                .with_description("Duration of statement execution")
                .build();
            let acquire_wait = meter
                .f64_histogram("seedkeeper_acquire_wait_seconds")
                .with_description("Time spent waiting for a connection permit and opening the connection")
                .build();
            let connections_opened_total = meter
                .u64_counter("seedkeeper_connections_opened_total")
                .with_description("Connections opened")
                .build();
            let connections_closed_total = meter
                .u64_counter("seedkeeper_connections_closed_total")
                .with_description("Connections closed")
                .build();
            let connections_open = meter
                .i64_up_down_counter("seedkeeper_connections_open")
                .with_description("Connections currently owned by a query or stream")
                .build();
            let stream_rows_total = meter
                .u64_counter("seedkeeper_stream_rows_total")
                .with_description("Rows delivered through streaming cursors")
                .build();

            Self {
                registry,
                _provider: provider,
                queries_total,
                query_errors_total,
                query_duration,
                acquire_wait,
                connections_opened_total,
                connections_closed_total,
                connections_open,
                stream_rows_total,
            }
        }

        pub fn record_query(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_acquire_wait(&self, elapsed: Duration) {
            self.acquire_wait.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_connection_opened(&self) {
            self.connections_opened_total.add(1, &[]);
            self.connections_open.add(1, &[]);
        }

        pub fn record_connection_closed(&self) {
            self.connections_closed_total.add(1, &[]);
            self.connections_open.add(-1, &[]);
        }

        pub fn record_stream_row(&self) {
            self.stream_rows_total.add(1, &[]);
        }

        /// Prometheus text exposition of everything recorded so far.
        pub fn gather_text(&self) -> String {
            let mut buf = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8_lossy(&buf).into_owned()
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::Span;

    pub fn acquire_connection_span(purpose: &str) -> Span {
        tracing::debug_span!("seedkeeper.acquire", purpose = purpose)
    }

    pub fn prepare_statement_span(sql: &str) -> Span {
        tracing::debug_span!("seedkeeper.prepare", sql = sql)
    }

    pub fn execute_query_span(sql: &str) -> Span {
        tracing::info_span!("seedkeeper.execute", sql = sql)
    }

    pub fn count_rows_span() -> Span {
        tracing::debug_span!("seedkeeper.found_rows")
    }

    pub fn fetch_rows_span(fetch_size: usize) -> Span {
        tracing::debug_span!("seedkeeper.fetch", fetch_size = fetch_size)
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_record_without_panicking() {
        METRICS.record_query(Duration::from_millis(3));
        METRICS.record_query_error();
        METRICS.record_connection_opened();
        METRICS.record_connection_closed();
        METRICS.record_stream_row();
        METRICS.record_acquire_wait(Duration::from_millis(1));
        let _ = METRICS.gather_text();
    }
}
