use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_REGION_ENTRIES, METRIC_REGION_HIT, METRIC_REGION_LOCK_CONFLICT, METRIC_REGION_MISS,
    METRIC_REGION_PUT, METRIC_REGION_REMOVE, METRIC_REGION_STALE_WRITE, METRIC_TIMESTAMP_TOUCH,
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
        })
}

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_REGION_HIT,
            Unit::Count,
            "Reads served from a cache region."
        );
        describe_counter!(
            METRIC_REGION_MISS,
            Unit::Count,
            "Reads that found nothing readable (absent, locked or stale)."
        );
        describe_counter!(
            METRIC_REGION_PUT,
            Unit::Count,
            "Entries stored by loads, inserts or committed updates."
        );
        describe_counter!(
            METRIC_REGION_REMOVE,
            Unit::Count,
            "Entries removed by invalidation, deletion or eviction."
        );
        describe_counter!(
            METRIC_REGION_LOCK_CONFLICT,
            Unit::Count,
            "Writers refused because another transaction held the soft lock."
        );
        describe_counter!(
            METRIC_REGION_STALE_WRITE,
            Unit::Count,
            "Updates discarded because their soft lock expired or was replaced."
        );
        describe_gauge!(
            METRIC_REGION_ENTRIES,
            Unit::Count,
            "Stored keys per region at the last snapshot."
        );
        describe_counter!(
            METRIC_TIMESTAMP_TOUCH,
            Unit::Count,
            "Committed writes recorded against a table's update timestamp."
        );
    });
}
