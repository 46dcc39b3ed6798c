//! ---
//! hive_section: "02-messaging-ipc-data-model"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Bus activity logging and Prometheus counters."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tracing::debug;

use crate::envelope::Envelope;
use crate::state::ConnectionState;

/// Direction of envelope movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope published by this client.
    Outbound,
    /// Envelope consumed from this client's queue.
    Inbound,
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: MessageDirection, envelope: &Envelope) {
    debug!(
        message_id = %envelope.message_id,
        source = %envelope.source,
        target = envelope.target.as_deref().unwrap_or("*"),
        kind = envelope.kind.as_str(),
        timestamp = envelope.timestamp,
        direction = ?direction,
        "bus activity"
    );
}

/// Prometheus handles for bus activity.
#[derive(Clone)]
pub struct BusMetrics {
    published: IntCounter,
    publish_failures: IntCounter,
    delivered: IntCounter,
    rejected: IntCounter,
    connect_failures: IntCounter,
    reconnects: IntCounter,
    connection_state: IntGauge,
}

impl BusMetrics {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.published.clone()))?;
        registry.register(Box::new(metrics.publish_failures.clone()))?;
        registry.register(Box::new(metrics.delivered.clone()))?;
        registry.register(Box::new(metrics.rejected.clone()))?;
        registry.register(Box::new(metrics.connect_failures.clone()))?;
        registry.register(Box::new(metrics.reconnects.clone()))?;
        registry.register(Box::new(metrics.connection_state.clone()))?;
        Ok(metrics)
    }

    /// Handles that count locally but are exported nowhere.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::build()
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            published: IntCounter::with_opts(Opts::new(
                "hive_bus_envelopes_published_total",
                "Envelopes accepted by the broker",
            ))?,
            publish_failures: IntCounter::with_opts(Opts::new(
                "hive_bus_publish_failures_total",
                "Publishes that failed or were refused while disconnected",
            ))?,
            delivered: IntCounter::with_opts(Opts::new(
                "hive_bus_envelopes_delivered_total",
                "Inbound envelopes dispatched to listeners",
            ))?,
            rejected: IntCounter::with_opts(Opts::new(
                "hive_bus_frames_rejected_total",
                "Inbound frames discarded because they did not decode",
            ))?,
            connect_failures: IntCounter::with_opts(Opts::new(
                "hive_bus_connect_failures_total",
                "Connection or topology setup attempts that failed",
            ))?,
            reconnects: IntCounter::with_opts(Opts::new(
                "hive_bus_reconnects_total",
                "Reconnect attempts fired by the retry timer",
            ))?,
            connection_state: IntGauge::with_opts(Opts::new(
                "hive_bus_connection_state",
                "0 disconnected, 1 connecting, 2 connected, 3 closed",
            ))?,
        })
    }

    pub(crate) fn record_published(&self) {
        self.published.inc();
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.inc();
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.inc();
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.inc();
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.inc();
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.connection_state.set(state.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_exports_all_series() {
        let registry = Registry::new();
        let metrics = BusMetrics::register(&registry).expect("register metrics");
        metrics.record_published();
        metrics.record_rejected();
        metrics.set_state(ConnectionState::Connected);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_owned()).collect();
        assert_eq!(names.len(), 7);
        assert!(names.contains(&"hive_bus_envelopes_published_total".to_owned()));

        let state = families
            .iter()
            .find(|f| f.get_name() == "hive_bus_connection_state")
            .unwrap();
        assert_eq!(state.get_metric()[0].get_gauge().get_value(), 2.0);
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        BusMetrics::register(&registry).unwrap();
        assert!(BusMetrics::register(&registry).is_err());
    }
}
