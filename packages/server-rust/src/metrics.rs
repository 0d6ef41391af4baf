//! Metric names and registration.
//!
//! All series are registered up front by [`describe`] so the exporter can
//! serve help texts before the first event fires.

use metrics::{describe_counter, Unit};

/// Device connections admitted (WebSocket and HTTP poll).
pub const CONNECTIONS_OPENED: &str = "devicehub_connections_opened_total";

/// Device connections that reached terminal state.
pub const CONNECTIONS_CLOSED: &str = "devicehub_connections_closed_total";

/// Admissions that displaced a prior holder of the same identifier.
pub const CONNECTIONS_DISPLACED: &str = "devicehub_connections_displaced_total";

/// Admissions rejected before registration (bad channel, bad token, closed
/// manager, unknown handler).
pub const ADMISSIONS_REJECTED: &str = "devicehub_admissions_rejected_total";

/// Requests whose response did not arrive within the response timeout.
pub const SEND_TIMEOUTS: &str = "devicehub_send_timeouts_total";

/// Telemetry documents handed to the index sink.
pub const DOCUMENTS_INDEXED: &str = "devicehub_documents_indexed_total";

/// Registers descriptions for every series this crate emits.
pub fn describe() {
    describe_counter!(
        CONNECTIONS_OPENED,
        Unit::Count,
        "Device connections admitted"
    );
    describe_counter!(
        CONNECTIONS_CLOSED,
        Unit::Count,
        "Device connections that reached terminal state"
    );
    describe_counter!(
        CONNECTIONS_DISPLACED,
        Unit::Count,
        "Admissions that displaced a prior connection"
    );
    describe_counter!(
        ADMISSIONS_REJECTED,
        Unit::Count,
        "Admissions rejected before registration"
    );
    describe_counter!(
        SEND_TIMEOUTS,
        Unit::Count,
        "Requests that timed out waiting for a response"
    );
    describe_counter!(
        DOCUMENTS_INDEXED,
        Unit::Count,
        "Telemetry documents handed to the index sink"
    );
}
