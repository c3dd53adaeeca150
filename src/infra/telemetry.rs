use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::logging::ForwardLayer;

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// When `forward` is supplied, application events are additionally mirrored
/// into the common-logging pipeline.
pub fn init(logging: &LoggingSettings, forward: Option<ForwardLayer>) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .with(forward)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "docgen_file_cache_write_total",
            Unit::Count,
            "Total number of file cache writes by result."
        );
        describe_counter!(
            "docgen_file_cache_evicted_total",
            Unit::Count,
            "Total number of cache entries removed by eviction."
        );
        describe_counter!(
            "docgen_file_cache_evicted_bytes_total",
            Unit::Bytes,
            "Total bytes reclaimed by eviction."
        );
        describe_gauge!(
            "docgen_file_cache_size_bytes",
            Unit::Bytes,
            "Size of evictable cache entries at the last scan."
        );
        describe_gauge!(
            "docgen_clogs_queue_len",
            Unit::Count,
            "Current number of log records waiting in the batch queue."
        );
        describe_histogram!(
            "docgen_clogs_flush_batch_size",
            Unit::Count,
            "Number of log records drained per flush."
        );
        describe_counter!(
            "docgen_clogs_transfer_total",
            Unit::Count,
            "Total number of log batch transfers by outcome."
        );
    });
}
