use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the build labels survive text
/// exposition.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "export_streamer",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone)]
pub struct ExportMetrics {
    /// Blocks fully delivered and discarded from the log.
    pub blocks_acked: Counter,
    /// Blocks handed back to the log for redelivery (shutdown, executor gone).
    pub blocks_requeued: Counter,
    /// Blocks dropped after a decode failure or fatal decoder error.
    pub blocks_discarded_on_error: Counter,
    /// Rows delivered in acked blocks.
    pub rows_processed: Counter,
    /// Recoverable block errors; each one restarts a block from its first row.
    ///
    /// A steadily rising rate with a flat `blocks_acked` is a stuck feed.
    pub block_retries: Counter,
    pub decode_failures: Counter,
    /// Pumps stopped because their source was fenced or removed.
    pub fenced_sources: Counter,
    pub active_pumps: Gauge,
    /// Backoff currently being slept by a retrying block, 0 when none.
    pub current_backoff_ms: Gauge,
}

impl ExportMetrics {
    fn init() -> Self {
        Self {
            blocks_acked: Counter::default(),
            blocks_requeued: Counter::default(),
            blocks_discarded_on_error: Counter::default(),
            rows_processed: Counter::default(),
            block_retries: Counter::default(),
            decode_failures: Counter::default(),
            fenced_sources: Counter::default(),
            active_pumps: Gauge::default(),
            current_backoff_ms: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "blocks_acked",
            "Total number of export blocks acked",
            metrics.blocks_acked.clone(),
        );
        sub_registry.register(
            "blocks_requeued",
            "Total number of export blocks requeued for redelivery",
            metrics.blocks_requeued.clone(),
        );
        sub_registry.register(
            "blocks_discarded_on_error",
            "Total number of export blocks discarded after an unrecoverable error",
            metrics.blocks_discarded_on_error.clone(),
        );
        sub_registry.register(
            "rows_processed",
            "Total number of rows delivered in acked blocks",
            metrics.rows_processed.clone(),
        );
        sub_registry.register(
            "block_retries",
            "Total number of recoverable block errors",
            metrics.block_retries.clone(),
        );
        sub_registry.register(
            "decode_failures",
            "Total number of blocks with a malformed row",
            metrics.decode_failures.clone(),
        );
        sub_registry.register(
            "fenced_sources",
            "Total number of pumps stopped by fencing or source removal",
            metrics.fenced_sources.clone(),
        );
        sub_registry.register(
            "active_pumps",
            "Number of running block pumps",
            metrics.active_pumps.clone(),
        );
        sub_registry.register(
            "current_backoff_ms",
            "Backoff currently slept by a retrying block",
            metrics.current_backoff_ms.clone(),
        );
        metrics
    }
}

pub static EXPORT_METRICS: OnceCell<ExportMetrics> = OnceCell::const_new();

#[cfg(test)]
mod tests {
    use super::{register_build_info_metric, ExportMetrics};
    use crate::build_info;
    use prometheus_client::{encoding::text::encode, registry::Registry};

    #[test]
    fn build_info_metric_contains_version_and_commit_labels() {
        let mut registry = Registry::default();
        register_build_info_metric(&mut registry, "export");

        let mut encoded = String::new();
        encode(&mut encoded, &registry).expect("failed to encode metrics");

        assert!(
            encoded.contains("export_build_info"),
            "expected an export_build_info metric"
        );
        assert!(
            encoded.contains(&format!("version=\"{}\"", build_info::VERSION)),
            "expected build version label in metrics output"
        );
        assert!(
            encoded.contains(&format!("commit=\"{}\"", build_info::short_commit_hash())),
            "expected commit label in metrics output"
        );
    }

    #[test]
    fn pump_metrics_are_exposed_under_prefix() {
        let mut registry = Registry::default();
        let metrics = ExportMetrics::register(&mut registry, "export");
        metrics.blocks_acked.inc();
        metrics.active_pumps.set(3);

        let mut encoded = String::new();
        encode(&mut encoded, &registry).expect("failed to encode metrics");

        assert!(encoded.contains("export_blocks_acked_total 1"));
        assert!(encoded.contains("export_active_pumps 3"));
    }
}
