//! Telemetry emitted by the resource manager itself.
//!
//! The library only records through the `metrics` facade; whoever drives the
//! tests decides whether a recorder (e.g., a Prometheus exporter) is installed.
//! Without one, recording is a no-op.

use ::metrics::{describe_counter, describe_histogram, Unit};
use std::sync::Once;

pub(crate) const PROVISIONING_ATTEMPTS: &str = "spanner_resource_manager.provisioning_attempts";
pub(crate) const PROVISIONING_RETRIES: &str = "spanner_resource_manager.provisioning_retries";
pub(crate) const PROVISIONING_LATENCY: &str = "spanner_resource_manager.provisioning_latency";
pub(crate) const CLEANUP_FAILURES: &str = "spanner_resource_manager.cleanup_failures";

/// Describes the metrics to the installed recorder. Only the first call has an effect.
pub fn init() {
    static DESCRIBED: Once = Once::new();
    DESCRIBED.call_once(|| {
        describe_counter!(
            PROVISIONING_ATTEMPTS,
            Unit::Count,
            "Runs of the instance/database/schema provisioning sequence"
        );
        describe_counter!(
            PROVISIONING_RETRIES,
            Unit::Count,
            "Provisioning sequences restarted after a resource exhaustion error"
        );
        describe_histogram!(
            PROVISIONING_LATENCY,
            Unit::Seconds,
            "Time from the first provisioning attempt until the database is ready"
        );
        describe_counter!(
            CLEANUP_FAILURES,
            Unit::Count,
            "Cleanups that failed to delete the instance or drop the database"
        );
    });
}
