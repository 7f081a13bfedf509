use prometheus::{IntCounter, Opts, Registry};

/// Bus-level prometheus metrics.
pub struct BusMetrics {
    /// Total messages flushed to queue tables.
    pub messages_sent: IntCounter,
    /// Total messages leased by receive calls.
    pub messages_received: IntCounter,
    /// Receive calls that found no deliverable row.
    pub empty_receives: IntCounter,
    /// Receive attempts that lost a lock deadlock and returned nothing.
    pub receive_deadlocks: IntCounter,
    /// Rows deleted by the expiration sweeper.
    pub expired_messages_deleted: IntCounter,
    /// Lapsed leases cleared by the sweeper.
    pub leases_reclaimed: IntCounter,
    /// Exclusive-access lock acquisitions that succeeded.
    pub locks_acquired: IntCounter,
    /// Exclusive-access lock acquisitions that lost to a holder.
    pub locks_contended: IntCounter,
    /// Expired locks removed by the lock sweeper.
    pub locks_swept: IntCounter,
}

impl BusMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages_sent = IntCounter::with_opts(Opts::new(
            "bus_messages_sent_total",
            "Total messages flushed to queue tables",
        ))?;
        let messages_received = IntCounter::with_opts(Opts::new(
            "bus_messages_received_total",
            "Total messages leased by receive calls",
        ))?;
        let empty_receives = IntCounter::with_opts(Opts::new(
            "bus_empty_receives_total",
            "Receive calls that found no deliverable row",
        ))?;
        let receive_deadlocks = IntCounter::with_opts(Opts::new(
            "bus_receive_deadlocks_total",
            "Receive attempts terminated by a lock deadlock",
        ))?;
        let expired_messages_deleted = IntCounter::with_opts(Opts::new(
            "bus_expired_messages_deleted_total",
            "Rows deleted by the expiration sweeper",
        ))?;
        let leases_reclaimed = IntCounter::with_opts(Opts::new(
            "bus_leases_reclaimed_total",
            "Lapsed leases cleared by the sweeper",
        ))?;
        let locks_acquired = IntCounter::with_opts(Opts::new(
            "bus_locks_acquired_total",
            "Exclusive-access lock acquisitions that succeeded",
        ))?;
        let locks_contended = IntCounter::with_opts(Opts::new(
            "bus_locks_contended_total",
            "Exclusive-access lock acquisitions that lost to a holder",
        ))?;
        let locks_swept = IntCounter::with_opts(Opts::new(
            "bus_locks_swept_total",
            "Expired locks removed by the lock sweeper",
        ))?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(empty_receives.clone()))?;
        registry.register(Box::new(receive_deadlocks.clone()))?;
        registry.register(Box::new(expired_messages_deleted.clone()))?;
        registry.register(Box::new(leases_reclaimed.clone()))?;
        registry.register(Box::new(locks_acquired.clone()))?;
        registry.register(Box::new(locks_contended.clone()))?;
        registry.register(Box::new(locks_swept.clone()))?;

        Ok(Self {
            messages_sent,
            messages_received,
            empty_receives,
            receive_deadlocks,
            expired_messages_deleted,
            leases_reclaimed,
            locks_acquired,
            locks_contended,
            locks_swept,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_against_a_fresh_registry() {
        let registry = Registry::new();
        let metrics = BusMetrics::new(&registry).unwrap();
        metrics.messages_sent.inc();
        metrics.empty_receives.inc_by(3);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "bus_messages_sent_total"));
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        BusMetrics::new(&registry).unwrap();
        assert!(BusMetrics::new(&registry).is_err());
    }
}
