//! Metric names, descriptions and label helpers for the relay.
//!
//! Every series the relay emits is named here so the Prometheus exporter
//! and the call sites agree on spelling, units and histogram buckets.

use anyhow::{Context, Result};
use atelier_relay_core::DataType;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const CONNECTIONS_ACTIVE: &str = "atelier_relay_connections_active";
pub const CONNECTIONS_TOTAL: &str = "atelier_relay_connections_total";
pub const CONNECTIONS_CLOSED_TOTAL: &str = "atelier_relay_connections_closed_total";
pub const CHANNELS_SUPERSEDED_TOTAL: &str = "atelier_relay_channels_superseded_total";
pub const IDLE_RECLAIMED_TOTAL: &str = "atelier_relay_idle_reclaimed_total";
pub const HEARTBEATS_TOTAL: &str = "atelier_relay_heartbeats_total";
pub const BROADCASTS_TOTAL: &str = "atelier_relay_broadcasts_total";
pub const BROADCASTS_REJECTED_TOTAL: &str = "atelier_relay_broadcasts_rejected_total";
pub const FRAMES_DELIVERED_TOTAL: &str = "atelier_relay_frames_delivered_total";
pub const WRITE_FAILURES_TOTAL: &str = "atelier_relay_write_failures_total";
pub const BROADCAST_DURATION_SECONDS: &str = "atelier_relay_broadcast_duration_seconds";

/// Fan-out latency buckets. The upper end sits just past the default
/// write timeout so evictions land in their own bucket.
const BROADCAST_DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 2.5, 5.0,
];

/// Builds the Prometheus recorder, installs it globally and registers the
/// relay's metric descriptions.
pub fn install_prometheus() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(BROADCAST_DURATION_SECONDS.to_string()),
            BROADCAST_DURATION_BUCKETS,
        )
        .context("invalid broadcast duration buckets")?
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_gauge!(CONNECTIONS_ACTIVE, Unit::Count, "Push channels currently registered");
    describe_counter!(CONNECTIONS_TOTAL, Unit::Count, "Push channels opened");
    describe_counter!(
        CONNECTIONS_CLOSED_TOTAL,
        Unit::Count,
        "Push channels removed, by reason"
    );
    describe_counter!(
        CHANNELS_SUPERSEDED_TOTAL,
        Unit::Count,
        "Channels closed because their client id registered again"
    );
    describe_counter!(
        IDLE_RECLAIMED_TOTAL,
        Unit::Count,
        "Channels reclaimed after their stream stopped draining"
    );
    describe_counter!(HEARTBEATS_TOTAL, Unit::Count, "Heartbeat frames written");
    describe_counter!(
        BROADCASTS_TOTAL,
        Unit::Count,
        "Change events fanned out, by data type"
    );
    describe_counter!(
        BROADCASTS_REJECTED_TOTAL,
        Unit::Count,
        "Broadcast requests rejected before fan-out, by reason"
    );
    describe_counter!(
        FRAMES_DELIVERED_TOTAL,
        Unit::Count,
        "dataChange frames written to push channels"
    );
    describe_counter!(
        WRITE_FAILURES_TOTAL,
        Unit::Count,
        "Fan-out writes that failed or timed out, by reason"
    );
    describe_histogram!(
        BROADCAST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from publish to every write settling"
    );
}

/// Label value for a data type. Names outside the known set come from
/// request bodies, so they share a single `other` series.
pub fn data_type_label(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Products => "products",
        DataType::Orders => "orders",
        DataType::Customers => "customers",
        DataType::Categories => "categories",
        DataType::Boutiques => "boutiques",
        DataType::Other(_) => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_data_types_share_one_label() {
        assert_eq!(data_type_label(&DataType::Orders), "orders");
        assert_eq!(data_type_label(&DataType::Other("junk-1".into())), "other");
        assert_eq!(data_type_label(&DataType::Other("junk-2".into())), "other");
        for known in DataType::KNOWN {
            assert_eq!(data_type_label(&known), known.as_str());
        }
    }
}
