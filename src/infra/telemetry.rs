use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })?;

    tracing::debug!(
        level = %logging.level,
        json = logging.format == LogFormat::Json,
        "telemetry initialized"
    );
    Ok(())
}

/// Register descriptions for every cache metric with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "icebreak_cache_hit_total",
            Unit::Count,
            "Reads served from a fresh or in-flight cache entry."
        );
        describe_counter!(
            "icebreak_cache_miss_total",
            Unit::Count,
            "Reads that started a blocking fetch."
        );
        describe_counter!(
            "icebreak_cache_stale_served_total",
            Unit::Count,
            "Reads served stale data while a background refresh ran."
        );
        describe_counter!(
            "icebreak_cache_dedup_join_total",
            Unit::Count,
            "Reads that joined a fetch already in flight."
        );
        describe_counter!(
            "icebreak_cache_fetch_total",
            Unit::Count,
            "Fetcher invocations."
        );
        describe_counter!(
            "icebreak_cache_fetch_error_total",
            Unit::Count,
            "Fetcher invocations that failed."
        );
        describe_counter!(
            "icebreak_cache_late_write_dropped_total",
            Unit::Count,
            "Fetch results discarded because the key was invalidated mid-flight."
        );
        describe_counter!(
            "icebreak_cache_invalidated_total",
            Unit::Count,
            "Entries removed by invalidation or clear."
        );
        describe_histogram!(
            "icebreak_cache_fetch_ms",
            Unit::Milliseconds,
            "Fetcher latency in milliseconds."
        );
    });
}
