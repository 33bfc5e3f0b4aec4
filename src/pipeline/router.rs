use super::stage::{Stage, StageContext, StageError, StageFlow};
use crate::envelope::Envelope;
use crate::exchange::ExchangeId;
use crate::subscription::Symbol;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Envelope field a routing condition evaluates against.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Exchange,
    Symbol,
    DataType,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOp {
    And,
    Or,
}

/// Rule evaluation strategy.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Stop at the first matching rule.
    FirstMatch,
    /// Collect every matching target.
    AllMatches,
    /// Collect matches at the highest priority level present.
    PriorityBased,
}

/// Compiled routing condition. PATTERN regexes are compiled once at rule
/// install time; PREDICATE conditions reference registered predicate ids.
#[derive(Clone, Debug)]
pub enum RuleCondition {
    Exact {
        field: RecordField,
        values: Vec<String>,
    },
    Pattern {
        field: RecordField,
        regex: Regex,
    },
    Predicate {
        id: String,
    },
    Composite {
        op: CompositeOp,
        conditions: Vec<RuleCondition>,
    },
}

impl RuleCondition {
    pub fn exact<V>(field: RecordField, value: V) -> Self
    where
        V: Into<String>,
    {
        Self::Exact {
            field,
            values: vec![value.into()],
        }
    }

    pub fn pattern(field: RecordField, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern {
            field,
            regex: Regex::new(pattern)?,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Topic,
    Channel,
    Pipeline,
    Function,
}

/// Destination set produced by a matching rule. Destinations may carry
/// `{exchange}`, `{symbol}` and `{type}` placeholders expanded at route time.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct RouteTarget {
    pub kind: TargetKind,
    pub destinations: Vec<String>,
    /// Registered transform id applied per destination, if any.
    pub transform: Option<String>,
}

impl RouteTarget {
    pub fn topic<S>(destination: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            kind: TargetKind::Topic,
            destinations: vec![destination.into()],
            transform: None,
        }
    }

    pub fn topics<I, S>(destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: TargetKind::Topic,
            destinations: destinations.into_iter().map(Into::into).collect(),
            transform: None,
        }
    }
}

/// One prioritized routing rule.
#[derive(Clone, Debug)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// Higher first.
    pub priority: i32,
    pub condition: RuleCondition,
    pub target: RouteTarget,
}

/// Router stage configuration.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub strategy: RoutingStrategy,
    pub default_target: Option<RouteTarget>,
    pub enable_fallback: bool,
    pub fallback_target: Option<RouteTarget>,
    pub enable_caching: bool,
    pub cache_size: usize,
    pub cache_ttl_ms: u64,
    pub enable_duplication: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::FirstMatch,
            default_target: None,
            enable_fallback: false,
            fallback_target: None,
            enable_caching: true,
            cache_size: 1_000,
            cache_ttl_ms: 60_000,
            enable_duplication: false,
        }
    }
}

impl RouterConfig {
    fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Registered routing predicate. Hosts only accept registered ids, never
/// arbitrary code from configuration.
pub type RoutePredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Resolved destination set for one envelope.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct RouteResolution {
    pub destinations: Vec<String>,
    pub applied_rules: Vec<String>,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
struct CacheKey {
    exchange: ExchangeId,
    symbol: Symbol,
    data_type: String,
}

struct CachedRoute {
    resolution: RouteResolution,
    cached_at: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct RouteCache {
    entries: HashMap<CacheKey, CachedRoute>,
}

impl RouteCache {
    fn get(&mut self, key: &CacheKey, ttl: Duration) -> Option<RouteResolution> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.cached_at.elapsed() < ttl => {
                entry.last_used = Instant::now();
                Some(entry.resolution.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: CacheKey, resolution: RouteResolution, capacity: usize) {
        if capacity == 0 {
            return;
        }

        if self.entries.len() >= capacity && !self.entries.contains_key(&key) {
            // LRU eviction of the least recently used entry.
            if let Some(evict) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&evict);
            }
        }

        let now = Instant::now();
        self.entries.insert(
            key,
            CachedRoute {
                resolution,
                cached_at: now,
                last_used: now,
            },
        );
    }
}

/// Cache counters for the stats surface.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct RouterCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub condition_errors: u64,
}

/// Router stage: evaluates prioritized routing rules and resolves the
/// destination set per envelope.
///
/// The compiled rule list is immutable once installed; updates swap the whole
/// list atomically and invalidate the result cache.
pub struct RouterStage {
    config: RouterConfig,
    rules: RwLock<Arc<Vec<RoutingRule>>>,
    predicates: RwLock<HashMap<String, RoutePredicate>>,
    cache: Mutex<RouteCache>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    condition_errors: AtomicU64,
}

impl RouterStage {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            rules: RwLock::new(Arc::new(Vec::new())),
            predicates: RwLock::new(HashMap::new()),
            cache: Mutex::new(RouteCache::default()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            condition_errors: AtomicU64::new(0),
        }
    }

    pub fn with_rules(config: RouterConfig, rules: Vec<RoutingRule>) -> Self {
        let stage = Self::new(config);
        stage.set_rules(rules);
        stage
    }

    /// Register a named predicate referenced by `RuleCondition::Predicate`.
    pub fn register_predicate<S>(&self, id: S, predicate: RoutePredicate)
    where
        S: Into<String>,
    {
        self.predicates.write().insert(id.into(), predicate);
    }

    /// Replace the whole rule list, recompiled into priority-descending
    /// order, and invalidate the cache.
    pub fn set_rules(&self, mut rules: Vec<RoutingRule>) {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        *self.rules.write() = Arc::new(rules);
        self.cache.lock().entries.clear();
    }

    /// Install or replace one rule by id.
    pub fn upsert_rule(&self, rule: RoutingRule) {
        let mut rules: Vec<RoutingRule> = self.rules.read().as_ref().clone();
        rules.retain(|existing| existing.id != rule.id);
        rules.push(rule);
        self.set_rules(rules);
    }

    /// Remove one rule by id. Returns whether it was present.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules: Vec<RoutingRule> = self.rules.read().as_ref().clone();
        let before = rules.len();
        rules.retain(|existing| existing.id != id);
        let removed = rules.len() != before;
        if removed {
            self.set_rules(rules);
        }
        removed
    }

    pub fn cache_stats(&self) -> RouterCacheStats {
        RouterCacheStats {
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
            condition_errors: self.condition_errors.load(Ordering::Relaxed),
        }
    }

    fn field_value(envelope: &Envelope, field: RecordField) -> String {
        match field {
            RecordField::Exchange => envelope.event.exchange.as_str().to_string(),
            RecordField::Symbol => envelope.event.symbol.to_string(),
            RecordField::DataType => envelope.event.data_type().to_string(),
        }
    }

    fn matches(&self, condition: &RuleCondition, envelope: &Envelope) -> bool {
        match condition {
            RuleCondition::Exact { field, values } => {
                let value = Self::field_value(envelope, *field);
                values.iter().any(|candidate| candidate == &value)
            }
            RuleCondition::Pattern { field, regex } => {
                regex.is_match(&Self::field_value(envelope, *field))
            }
            RuleCondition::Predicate { id } => {
                let predicate = self.predicates.read().get(id).cloned();
                match predicate {
                    Some(predicate) => {
                        // A predicate that panics is logged, counted and
                        // treated as a non-match; it must not abort routing
                        // of the remaining rules.
                        match catch_unwind(AssertUnwindSafe(|| predicate(envelope))) {
                            Ok(matched) => matched,
                            Err(_) => {
                                self.condition_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(predicate = %id, "routing predicate panicked, treating as non-match");
                                false
                            }
                        }
                    }
                    None => {
                        self.condition_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(predicate = %id, "unknown routing predicate id, treating as non-match");
                        false
                    }
                }
            }
            RuleCondition::Composite { op, conditions } => match op {
                CompositeOp::And => conditions
                    .iter()
                    .all(|condition| self.matches(condition, envelope)),
                CompositeOp::Or => conditions
                    .iter()
                    .any(|condition| self.matches(condition, envelope)),
            },
        }
    }

    fn expand(destination: &str, envelope: &Envelope) -> String {
        destination
            .replace("{exchange}", envelope.event.exchange.as_str())
            .replace("{symbol}", envelope.event.symbol.as_str())
            .replace("{type}", &envelope.event.data_type().to_string())
    }

    fn resolve_target(target: &RouteTarget, envelope: &Envelope) -> Vec<String> {
        target
            .destinations
            .iter()
            .map(|destination| Self::expand(destination, envelope))
            .collect()
    }

    /// Evaluate the rule list for the envelope and produce its destination
    /// set.
    pub fn route(&self, envelope: &Envelope) -> RouteResolution {
        let cache_key = CacheKey {
            exchange: envelope.event.exchange,
            symbol: envelope.event.symbol.clone(),
            data_type: envelope.event.data_type().to_string(),
        };

        if self.config.enable_caching {
            if let Some(resolution) = self
                .cache
                .lock()
                .get(&cache_key, self.config.cache_ttl())
            {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return resolution;
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let rules = Arc::clone(&*self.rules.read());
        let mut matched: Vec<&RoutingRule> = Vec::new();

        for rule in rules.iter().filter(|rule| rule.enabled) {
            match self.config.strategy {
                RoutingStrategy::FirstMatch => {
                    if self.matches(&rule.condition, envelope) {
                        matched.push(rule);
                        break;
                    }
                }
                RoutingStrategy::AllMatches => {
                    if self.matches(&rule.condition, envelope) {
                        matched.push(rule);
                    }
                }
                RoutingStrategy::PriorityBased => {
                    // Rules are sorted priority-descending: once a lower
                    // priority level is reached after a match, stop.
                    if let Some(first) = matched.first() {
                        if rule.priority < first.priority {
                            break;
                        }
                    }
                    if self.matches(&rule.condition, envelope) {
                        matched.push(rule);
                    }
                }
            }
        }

        let resolution = if matched.is_empty() {
            let target = self.config.default_target.as_ref().or_else(|| {
                self.config
                    .enable_fallback
                    .then_some(self.config.fallback_target.as_ref())
                    .flatten()
            });

            RouteResolution {
                destinations: target
                    .map(|target| Self::resolve_target(target, envelope))
                    .unwrap_or_default(),
                applied_rules: Vec::new(),
            }
        } else {
            let mut destinations = Vec::new();
            let mut applied_rules = Vec::new();
            for rule in matched {
                for destination in Self::resolve_target(&rule.target, envelope) {
                    if !destinations.contains(&destination) {
                        destinations.push(destination);
                    }
                }
                applied_rules.push(rule.name.clone());
            }
            RouteResolution {
                destinations,
                applied_rules,
            }
        };

        if self.config.enable_caching {
            self.cache.lock().insert(
                cache_key,
                resolution.clone(),
                self.config.cache_size,
            );
        }

        resolution
    }
}

#[async_trait]
impl Stage for RouterStage {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        _: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        let resolution = self.route(&envelope);

        if resolution.destinations.is_empty() {
            // No rules, no default, no fallback: the envelope has nowhere to
            // go and is consumed cleanly.
            return Ok(StageFlow::Consumed);
        }

        if !resolution.applied_rules.is_empty() {
            envelope
                .attributes
                .insert("routing_rules".to_string(), resolution.applied_rules.join(","));
        }

        if self.config.enable_duplication && resolution.destinations.len() > 1 {
            let copies = resolution
                .destinations
                .iter()
                .map(|destination| envelope.duplicate_for(destination))
                .collect();
            Ok(StageFlow::Split(copies))
        } else {
            envelope.metadata.routing_keys = resolution.destinations;
            Ok(StageFlow::Continue(envelope))
        }
    }
}
