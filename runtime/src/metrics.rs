//! Metrics for the ticket runtime.
//!
//! Recorded through the `metrics` facade; install any recorder (for example a
//! Prometheus exporter) in the host process to collect them. Without one the
//! calls are no-ops.
//!
//! - `ticket_issued_total`
//! - `ticket_transferred_total`
//! - `ticket_submission_rejected_total`
//! - `ticket_signature_requests_total{outcome="signed"|"denied"}`
//! - `ticket_notifications_applied_total`
//! - `ticket_submission_duration_seconds`

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Register all metric descriptions.
///
/// Call once after installing a recorder.
pub fn register_metrics() {
    describe_counter!("ticket_issued_total", "Total number of tickets issued");
    describe_counter!(
        "ticket_transferred_total",
        "Total number of ticket transfers accepted by the ledger (redeems included)"
    );
    describe_counter!(
        "ticket_submission_rejected_total",
        "Total number of transactions the ledger rejected"
    );
    describe_counter!(
        "ticket_signature_requests_total",
        "Total number of counter-signature requests handled, by outcome"
    );
    describe_counter!(
        "ticket_notifications_applied_total",
        "Total number of accepted transactions applied to the ownership index"
    );
    describe_histogram!(
        "ticket_submission_duration_seconds",
        "Time taken by the ledger to answer a submission"
    );
}

/// Ticket runtime metrics recorder.
pub struct TicketMetrics;

impl TicketMetrics {
    /// Record an accepted issuance.
    pub fn record_issued() {
        counter!("ticket_issued_total").increment(1);
    }

    /// Record an accepted transfer or redeem.
    pub fn record_transferred() {
        counter!("ticket_transferred_total").increment(1);
    }

    /// Record a ledger submission and its latency.
    pub fn record_submission(duration: Duration, rejected: bool) {
        histogram!("ticket_submission_duration_seconds").record(duration.as_secs_f64());
        if rejected {
            counter!("ticket_submission_rejected_total").increment(1);
        }
    }

    /// Record a handled counter-signature request.
    pub fn record_signature_request(signed: bool) {
        let outcome = if signed { "signed" } else { "denied" };
        counter!("ticket_signature_requests_total", "outcome" => outcome).increment(1);
    }

    /// Record an applied acceptance notification.
    pub fn record_notification_applied() {
        counter!("ticket_notifications_applied_total").increment(1);
    }
}
