use super::{
    Subscription, SubscriptionError, SubscriptionErrorKind, SubscriptionKey, SubscriptionRecord,
    SubscriptionState,
};
use crate::codec::{StreamCodec, StreamName};
use crate::connection::ConnectionId;
use crate::subscription::DataTypeKind;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Validation policy applied to incoming subscription requests.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionPolicy {
    pub strict_validation: bool,
    /// Regex a symbol must match when `strict_validation` is on.
    pub symbol_pattern: Option<String>,
    pub max_subscriptions: usize,
    pub disabled_data_types: Vec<DataTypeKind>,
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self {
            strict_validation: true,
            symbol_pattern: Some("^[A-Z0-9]{1,20}$".to_string()),
            max_subscriptions: 1_000,
            disabled_data_types: Vec::new(),
        }
    }
}

/// Events emitted by the [`SubscriptionRegistry`] once a listener attaches
/// via [`SubscriptionRegistry::subscribe_events`].
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    DataReceived {
        stream: StreamName,
        connection: ConnectionId,
        message_count: u64,
    },
    SubscriptionFailed {
        subscription: Subscription,
        error: SubscriptionError,
    },
    Migrated {
        from: ConnectionId,
        to: ConnectionId,
        moved: usize,
    },
    MigrationFailed {
        from: ConnectionId,
        to: ConnectionId,
        error: SubscriptionError,
    },
}

/// Outcome of a batch [`SubscriptionRegistry::subscribe`] call.
#[derive(Clone, Debug, Default)]
pub struct SubscribeSummary {
    /// Newly registered subscriptions, with their assigned stream name and
    /// connection.
    pub successful: Vec<SubscriptionRecord>,
    /// Subscriptions that were already registered; no side effects.
    pub existing: Vec<Subscription>,
    /// Rejected subscriptions with their classified error.
    pub failed: Vec<(Subscription, SubscriptionError)>,
}

impl SubscribeSummary {
    pub fn is_all_successful(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.successful
            .iter()
            .map(|record| record.subscription.clone())
            .collect()
    }
}

/// Outcome of a batch [`SubscriptionRegistry::unsubscribe`] call.
#[derive(Clone, Debug, Default)]
pub struct UnsubscribeSummary {
    /// Removed subscriptions, returned with state `Cancelled`.
    pub cancelled: Vec<SubscriptionRecord>,
    /// Subscriptions that were not registered.
    pub missing: Vec<Subscription>,
}

/// Counters snapshot for the stats surface.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub paused: usize,
    pub failed: usize,
    pub connections: usize,
    pub messages: u64,
    pub errors: u64,
}

struct Inner {
    by_key: HashMap<SubscriptionKey, SubscriptionRecord>,
    by_connection: HashMap<ConnectionId, HashSet<SubscriptionKey>>,
    by_stream: HashMap<StreamName, SubscriptionKey>,
}

/// Authoritative set of active logical subscriptions for one adapter.
///
/// Invariant: at most one subscription per key. All mutation is serialised
/// through this API; readers receive snapshots, never references into the
/// internal maps.
pub struct SubscriptionRegistry {
    policy: SubscriptionPolicy,
    symbol_pattern: Option<Regex>,
    codec: Arc<dyn StreamCodec>,
    inner: RwLock<Inner>,
    events: Mutex<Option<mpsc::UnboundedSender<RegistryEvent>>>,
    messages: AtomicU64,
    errors: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(policy: SubscriptionPolicy, codec: Arc<dyn StreamCodec>) -> Self {
        let symbol_pattern = policy
            .symbol_pattern
            .as_deref()
            .and_then(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    warn!(%error, pattern, "invalid symbol pattern, ignoring");
                    None
                }
            });

        Self {
            policy,
            symbol_pattern,
            codec,
            inner: RwLock::new(Inner {
                by_key: HashMap::new(),
                by_connection: HashMap::new(),
                by_stream: HashMap::new(),
            }),
            events: Mutex::new(None),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Attach a listener for [`RegistryEvent`]s. Only one listener is kept;
    /// a later call replaces the earlier channel.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    fn emit(&self, event: RegistryEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn validate(&self, subscription: &Subscription) -> Result<(), SubscriptionError> {
        if self
            .policy
            .disabled_data_types
            .contains(&subscription.data_type.kind())
        {
            return Err(SubscriptionError::new(
                SubscriptionErrorKind::UnsupportedDataType,
                format!("data type {} is disabled", subscription.data_type),
            ));
        }

        if self.policy.strict_validation {
            if let Some(pattern) = &self.symbol_pattern {
                if !pattern.is_match(subscription.symbol.as_str()) {
                    return Err(SubscriptionError::new(
                        SubscriptionErrorKind::SymbolNotFound,
                        format!(
                            "symbol {} does not match pattern {}",
                            subscription.symbol,
                            pattern.as_str()
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Register a batch of subscriptions.
    ///
    /// Idempotent per key: an already-registered subscription lands in
    /// `existing` with no side effects. A batch whose new entries would push
    /// the total above `max_subscriptions` is refused as a whole.
    ///
    /// Connection selection is delegated to `assign`; the registry records
    /// only the returned id.
    pub fn subscribe<F>(
        &self,
        subscriptions: Vec<Subscription>,
        mut assign: F,
    ) -> SubscribeSummary
    where
        F: FnMut(&Subscription) -> Result<ConnectionId, SubscriptionError>,
    {
        let mut summary = SubscribeSummary::default();
        let mut candidates = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            match self.validate(&subscription) {
                Ok(()) => match self.codec.build(&subscription) {
                    Ok(stream) => candidates.push((subscription, stream)),
                    Err(error) => {
                        let error = SubscriptionError::new(
                            SubscriptionErrorKind::InvalidStreamName,
                            error.to_string(),
                        );
                        self.emit(RegistryEvent::SubscriptionFailed {
                            subscription: subscription.clone(),
                            error: error.clone(),
                        });
                        summary.failed.push((subscription, error));
                    }
                },
                Err(error) => {
                    self.emit(RegistryEvent::SubscriptionFailed {
                        subscription: subscription.clone(),
                        error: error.clone(),
                    });
                    summary.failed.push((subscription, error));
                }
            }
        }

        let mut inner = self.inner.write();

        let mut new_candidates = Vec::with_capacity(candidates.len());
        for (subscription, stream) in candidates {
            let key = subscription.key();
            if inner.by_key.contains_key(&key) {
                summary.existing.push(subscription);
            } else {
                new_candidates.push((subscription, stream, key));
            }
        }

        // Bounded growth: refuse the whole batch, leaving the active set
        // untouched.
        if inner.by_key.len() + new_candidates.len() > self.policy.max_subscriptions {
            let error = SubscriptionError::new(
                SubscriptionErrorKind::MaxStreamsExceeded,
                format!(
                    "batch of {} would exceed max subscriptions {}",
                    new_candidates.len(),
                    self.policy.max_subscriptions
                ),
            );
            for (subscription, _, _) in new_candidates {
                self.emit(RegistryEvent::SubscriptionFailed {
                    subscription: subscription.clone(),
                    error: error.clone(),
                });
                summary.failed.push((subscription, error.clone()));
            }
            return summary;
        }

        for (subscription, stream, key) in new_candidates {
            match assign(&subscription) {
                Ok(connection) => {
                    let record = SubscriptionRecord {
                        subscription,
                        key: key.clone(),
                        stream: stream.clone(),
                        connection,
                        state: SubscriptionState::Pending,
                        subscribed_at: Utc::now(),
                        last_active_at: None,
                        message_count: 0,
                        error_count: 0,
                        last_error: None,
                    };

                    inner
                        .by_connection
                        .entry(connection)
                        .or_default()
                        .insert(key.clone());
                    inner.by_stream.insert(stream, key.clone());
                    summary.successful.push(record.clone());
                    inner.by_key.insert(key, record);
                }
                Err(error) => {
                    self.emit(RegistryEvent::SubscriptionFailed {
                        subscription: subscription.clone(),
                        error: error.clone(),
                    });
                    summary.failed.push((subscription, error));
                }
            }
        }

        summary
    }

    /// Remove a batch of subscriptions, returning the removed records with
    /// state `Cancelled`.
    pub fn unsubscribe(&self, subscriptions: Vec<Subscription>) -> UnsubscribeSummary {
        let mut summary = UnsubscribeSummary::default();
        let mut inner = self.inner.write();

        for subscription in subscriptions {
            let key = subscription.key();
            match inner.by_key.remove(&key) {
                Some(mut record) => {
                    if let Some(keys) = inner.by_connection.get_mut(&record.connection) {
                        keys.remove(&key);
                        if keys.is_empty() {
                            inner.by_connection.remove(&record.connection);
                        }
                    }
                    inner.by_stream.remove(&record.stream);
                    record.state = SubscriptionState::Cancelled;
                    summary.cancelled.push(record);
                }
                None => summary.missing.push(subscription),
            }
        }

        summary
    }

    pub fn has(&self, subscription: &Subscription) -> bool {
        self.inner.read().by_key.contains_key(&subscription.key())
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_key.is_empty()
    }

    /// Snapshot of every registered subscription record.
    pub fn active(&self) -> Vec<SubscriptionRecord> {
        self.inner.read().by_key.values().cloned().collect()
    }

    /// Snapshot of the records assigned to one connection.
    pub fn by_connection(&self, connection: ConnectionId) -> Vec<SubscriptionRecord> {
        let inner = self.inner.read();
        inner
            .by_connection
            .get(&connection)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.by_key.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark a pending subscription active (remote ack received, or immediate
    /// for exchanges without an explicit ack).
    pub fn activate(&self, key: &SubscriptionKey) -> bool {
        let mut inner = self.inner.write();
        match inner.by_key.get_mut(key) {
            Some(record) => {
                record.state = SubscriptionState::Active;
                true
            }
            None => false,
        }
    }

    pub fn pause(&self, key: &SubscriptionKey) -> bool {
        let mut inner = self.inner.write();
        match inner.by_key.get_mut(key) {
            Some(record) => {
                record.state = SubscriptionState::Paused;
                true
            }
            None => false,
        }
    }

    pub fn resume(&self, key: &SubscriptionKey) -> bool {
        let mut inner = self.inner.write();
        match inner.by_key.get_mut(key) {
            Some(record) if record.state == SubscriptionState::Paused => {
                record.state = SubscriptionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Transactionally move every subscription assigned to `from` onto `to`,
    /// updating the per-connection indices in one step.
    pub fn migrate(&self, from: ConnectionId, to: ConnectionId) -> Result<usize, SubscriptionError> {
        if from == to {
            let error = SubscriptionError::new(
                SubscriptionErrorKind::ConnectionNotAvailable,
                "cannot migrate a connection onto itself",
            );
            self.emit(RegistryEvent::MigrationFailed {
                from,
                to,
                error: error.clone(),
            });
            return Err(error);
        }

        let mut inner = self.inner.write();
        let keys = inner.by_connection.remove(&from).unwrap_or_default();
        let moved = keys.len();

        for key in &keys {
            if let Some(record) = inner.by_key.get_mut(key) {
                record.connection = to;
            }
        }
        if moved > 0 {
            inner.by_connection.entry(to).or_default().extend(keys);
        }

        debug!(%from, %to, moved, "migrated subscriptions between connections");
        self.emit(RegistryEvent::Migrated { from, to, moved });
        Ok(moved)
    }

    /// Map an inbound wire stream name onto its subscription, updating
    /// counters. Unmatched names are dropped silently: they can race an
    /// unsubscribe.
    pub fn handle_stream_data(
        &self,
        stream: &StreamName,
        connection: ConnectionId,
    ) -> Option<SubscriptionKey> {
        let mut inner = self.inner.write();
        let key = inner.by_stream.get(stream)?.clone();
        let record = inner.by_key.get_mut(&key)?;

        record.message_count += 1;
        record.last_active_at = Some(Utc::now());
        let message_count = record.message_count;
        drop(inner);

        self.messages.fetch_add(1, Ordering::Relaxed);
        self.emit(RegistryEvent::DataReceived {
            stream: stream.clone(),
            connection,
            message_count,
        });
        Some(key)
    }

    /// Record an error against the subscription mapped by the wire stream
    /// name. Non-retryable errors transition the record to `Failed`.
    pub fn handle_error(
        &self,
        stream: &StreamName,
        error: SubscriptionError,
        _connection: ConnectionId,
    ) -> Option<SubscriptionKey> {
        let mut inner = self.inner.write();
        let key = inner.by_stream.get(stream)?.clone();
        let record = inner.by_key.get_mut(&key)?;

        record.error_count += 1;
        if !error.is_retryable() {
            record.state = SubscriptionState::Failed;
        }
        record.last_error = Some(error);
        drop(inner);

        self.errors.fetch_add(1, Ordering::Relaxed);
        Some(key)
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let mut stats = RegistryStats {
            total: inner.by_key.len(),
            connections: inner.by_connection.len(),
            messages: self.messages.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ..RegistryStats::default()
        };

        for record in inner.by_key.values() {
            match record.state {
                SubscriptionState::Pending => stats.pending += 1,
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Paused => stats.paused += 1,
                SubscriptionState::Failed => stats.failed += 1,
                SubscriptionState::Cancelled => {}
            }
        }

        stats
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_key.clear();
        inner.by_connection.clear();
        inner.by_stream.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binance::BinanceStreamCodec;
    use crate::subscription::DataType;

    fn registry(policy: SubscriptionPolicy) -> SubscriptionRegistry {
        SubscriptionRegistry::new(policy, Arc::new(BinanceStreamCodec))
    }

    fn assign_to(connection: ConnectionId) -> impl FnMut(&Subscription) -> Result<ConnectionId, SubscriptionError>
    {
        move |_| Ok(connection)
    }

    #[test]
    fn test_subscribe_registers_pending_records() {
        let registry = registry(SubscriptionPolicy::default());

        let summary = registry.subscribe(
            vec![
                Subscription::new("BTCUSDT", DataType::Trade),
                Subscription::new("ETHUSDT", DataType::Ticker),
            ],
            assign_to(ConnectionId(0)),
        );

        assert_eq!(summary.successful.len(), 2);
        assert!(summary.existing.is_empty());
        assert!(summary.failed.is_empty());
        assert_eq!(registry.len(), 2);

        let record = &summary.successful[0];
        assert_eq!(record.state, SubscriptionState::Pending);
        assert_eq!(record.stream.as_str(), "btcusdt@trade");
        assert_eq!(record.connection, ConnectionId(0));
    }

    #[test]
    fn test_subscribe_is_idempotent_per_key() {
        let registry = registry(SubscriptionPolicy::default());
        let subscription = Subscription::new("BTCUSDT", DataType::Trade);

        registry.subscribe(vec![subscription.clone()], assign_to(ConnectionId(0)));
        assert!(registry.has(&subscription));
        let count_before = registry.len();

        // A second subscribe for the same key reports `existing` and leaves
        // the active count unchanged.
        let summary = registry.subscribe(vec![subscription.clone()], assign_to(ConnectionId(1)));
        assert!(summary.successful.is_empty());
        assert_eq!(summary.existing, vec![subscription]);
        assert_eq!(registry.len(), count_before);
    }

    #[test]
    fn test_subscribe_batch_overflow_refused_as_whole() {
        let registry = registry(SubscriptionPolicy {
            max_subscriptions: 2,
            ..SubscriptionPolicy::default()
        });

        registry.subscribe(
            vec![Subscription::new("BTCUSDT", DataType::Trade)],
            assign_to(ConnectionId(0)),
        );
        assert_eq!(registry.len(), 1);

        // 1 active + 2 new > 2 max: whole batch refused, nothing committed.
        let summary = registry.subscribe(
            vec![
                Subscription::new("ETHUSDT", DataType::Trade),
                Subscription::new("BNBUSDT", DataType::Trade),
            ],
            assign_to(ConnectionId(0)),
        );

        assert!(summary.successful.is_empty());
        assert_eq!(summary.failed.len(), 2);
        for (_, error) in &summary.failed {
            assert_eq!(error.kind, SubscriptionErrorKind::MaxStreamsExceeded);
            assert!(!error.is_retryable());
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscribe_rejects_disabled_data_type() {
        let registry = registry(SubscriptionPolicy {
            disabled_data_types: vec![DataTypeKind::Ticker],
            ..SubscriptionPolicy::default()
        });

        let summary = registry.subscribe(
            vec![Subscription::new("BTCUSDT", DataType::Ticker)],
            assign_to(ConnectionId(0)),
        );

        assert_eq!(summary.failed.len(), 1);
        let (_, error) = &summary.failed[0];
        assert_eq!(error.kind, SubscriptionErrorKind::UnsupportedDataType);
        assert!(!error.is_retryable());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_subscribe_rejects_symbol_pattern_violation() {
        let registry = registry(SubscriptionPolicy {
            symbol_pattern: Some("^[A-Z]+USDT$".to_string()),
            ..SubscriptionPolicy::default()
        });

        let summary = registry.subscribe(
            vec![
                Subscription::new("BTCUSDT", DataType::Trade),
                Subscription::new("BTCEUR", DataType::Trade),
            ],
            assign_to(ConnectionId(0)),
        );

        assert_eq!(summary.successful.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        let (subscription, error) = &summary.failed[0];
        assert_eq!(subscription.symbol.as_str(), "BTCEUR");
        assert_eq!(error.kind, SubscriptionErrorKind::SymbolNotFound);
    }

    #[test]
    fn test_strict_validation_off_skips_symbol_pattern() {
        let registry = registry(SubscriptionPolicy {
            strict_validation: false,
            symbol_pattern: Some("^[A-Z]+USDT$".to_string()),
            ..SubscriptionPolicy::default()
        });

        let summary = registry.subscribe(
            vec![Subscription::new("BTCEUR", DataType::Trade)],
            assign_to(ConnectionId(0)),
        );
        assert_eq!(summary.successful.len(), 1);
    }

    #[test]
    fn test_unsubscribe_removes_and_reports_missing() {
        let registry = registry(SubscriptionPolicy::default());
        let subscribed = Subscription::new("BTCUSDT", DataType::Trade);
        let never = Subscription::new("ETHUSDT", DataType::Trade);

        registry.subscribe(vec![subscribed.clone()], assign_to(ConnectionId(0)));

        let summary = registry.unsubscribe(vec![subscribed.clone(), never.clone()]);
        assert_eq!(summary.cancelled.len(), 1);
        assert_eq!(summary.cancelled[0].state, SubscriptionState::Cancelled);
        assert_eq!(summary.missing, vec![never]);
        assert!(registry.is_empty());
        assert!(registry.by_connection(ConnectionId(0)).is_empty());
    }

    #[test]
    fn test_migrate_moves_per_connection_index() {
        let registry = registry(SubscriptionPolicy::default());
        registry.subscribe(
            vec![
                Subscription::new("BTCUSDT", DataType::Trade),
                Subscription::new("ETHUSDT", DataType::Trade),
            ],
            assign_to(ConnectionId(0)),
        );
        registry.subscribe(
            vec![Subscription::new("BNBUSDT", DataType::Trade)],
            assign_to(ConnectionId(1)),
        );

        let moved = registry.migrate(ConnectionId(0), ConnectionId(1)).unwrap();
        assert_eq!(moved, 2);
        assert!(registry.by_connection(ConnectionId(0)).is_empty());
        assert_eq!(registry.by_connection(ConnectionId(1)).len(), 3);

        for record in registry.active() {
            assert_eq!(record.connection, ConnectionId(1));
        }
    }

    #[test]
    fn test_migrate_onto_itself_fails_with_event() {
        let registry = registry(SubscriptionPolicy::default());
        let mut events = registry.subscribe_events();

        let result = registry.migrate(ConnectionId(0), ConnectionId(0));
        assert!(result.is_err());

        match events.try_recv() {
            Ok(RegistryEvent::MigrationFailed { from, to, .. }) => {
                assert_eq!(from, ConnectionId(0));
                assert_eq!(to, ConnectionId(0));
            }
            other => panic!("expected MigrationFailed event, got: {other:?}"),
        }
    }

    #[test]
    fn test_handle_stream_data_updates_counters() {
        let registry = registry(SubscriptionPolicy::default());
        let mut events = registry.subscribe_events();
        let subscription = Subscription::new("BTCUSDT", DataType::Trade);
        registry.subscribe(vec![subscription.clone()], assign_to(ConnectionId(0)));

        let stream = StreamName::from("btcusdt@trade");
        let key = registry.handle_stream_data(&stream, ConnectionId(0)).unwrap();
        assert_eq!(key, subscription.key());
        registry.handle_stream_data(&stream, ConnectionId(0)).unwrap();

        let records = registry.by_connection(ConnectionId(0));
        assert_eq!(records[0].message_count, 2);
        assert!(records[0].last_active_at.is_some());

        match events.try_recv() {
            Ok(RegistryEvent::DataReceived { message_count, .. }) => {
                assert_eq!(message_count, 1)
            }
            other => panic!("expected DataReceived event, got: {other:?}"),
        }
    }

    #[test]
    fn test_handle_stream_data_unmatched_is_silently_dropped() {
        let registry = registry(SubscriptionPolicy::default());
        // Can race an unsubscribe; not an error.
        assert_eq!(
            registry.handle_stream_data(&StreamName::from("ethusdt@trade"), ConnectionId(0)),
            None
        );
        assert_eq!(registry.stats().messages, 0);
    }

    #[test]
    fn test_handle_error_marks_failed_on_non_retryable() {
        let registry = registry(SubscriptionPolicy::default());
        let subscription = Subscription::new("BTCUSDT", DataType::Trade);
        registry.subscribe(vec![subscription.clone()], assign_to(ConnectionId(0)));
        let stream = StreamName::from("btcusdt@trade");

        // Retryable error: counted, state untouched.
        registry.handle_error(
            &stream,
            SubscriptionError::new(SubscriptionErrorKind::NetworkError, "transient"),
            ConnectionId(0),
        );
        let record = &registry.by_connection(ConnectionId(0))[0];
        assert_eq!(record.error_count, 1);
        assert_eq!(record.state, SubscriptionState::Pending);

        // Non-retryable error transitions the record to Failed.
        registry.handle_error(
            &stream,
            SubscriptionError::new(SubscriptionErrorKind::InvalidStreamName, "rejected"),
            ConnectionId(0),
        );
        let record = &registry.by_connection(ConnectionId(0))[0];
        assert_eq!(record.error_count, 2);
        assert_eq!(record.state, SubscriptionState::Failed);
    }

    #[test]
    fn test_activate_and_stats() {
        let registry = registry(SubscriptionPolicy::default());
        let subscription = Subscription::new("BTCUSDT", DataType::Trade);
        registry.subscribe(vec![subscription.clone()], assign_to(ConnectionId(0)));

        assert_eq!(registry.stats().pending, 1);
        assert!(registry.activate(&subscription.key()));

        let stats = registry.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.connections, 1);
    }

    #[test]
    fn test_clear_empties_every_index() {
        let registry = registry(SubscriptionPolicy::default());
        registry.subscribe(
            vec![Subscription::new("BTCUSDT", DataType::Trade)],
            assign_to(ConnectionId(0)),
        );

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.by_connection(ConnectionId(0)).is_empty());
        assert_eq!(
            registry.handle_stream_data(&StreamName::from("btcusdt@trade"), ConnectionId(0)),
            None
        );
    }
}
