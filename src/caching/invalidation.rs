//! # Query Invalidation
//!
//! [`QueryInvalidator`] owns the dependency graph between tables and cached query keys and
//! removes cached results when the data behind them changes.
//!
//! ## Strategies
//! - **Table**: delete the direct dependents of a table, optionally cascading to keys derived
//!   from them and to derived tables. Cascades are bounded by `max_dependency_depth` and by a
//!   visited set, so any topology (cycles included) terminates.
//! - **Data**: delete keys whose label contains an identifier, or (fuzzy) holds a token whose
//!   normalized edit-distance similarity reaches `fuzzy_threshold`.
//! - **Smart**: classify a [`ChangeContext`] by risk and pick an aggressive, selective or
//!   conservative strategy; related changes are followed up to `max_dependency_depth` levels.
//!
//! ## Batching
//! With batching enabled, requests are queued and flushed when the queue reaches
//! `batch_size` or on every `batch_interval` tick. A flush merges requests with identical
//! metadata so each table or identifier is processed once. Producers can submit requests
//! through an [`InvalidationSender`] channel instead of calling the invalidator directly.
//! Shutdown drains the channel and flushes the queue.
//!
//! Invalidation is idempotent and best-effort: keys the backend fails to delete are reported
//! in [`InvalidationReport::failed_keys`] and stay in the graph for the next attempt.

use super::dependency::DependencyGraph;
use super::events::{new_operation_id, CacheEvent, EventBus};
use super::stores::CacheBackend;
use crate::core::error::{EngineError, EngineResult};
use crate::observability::metrics::CacheMetrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invalidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Namespace of the query cache entries being invalidated
    pub namespace: String,

    /// Choose strategies from impact analysis; when off every smart request is aggressive
    pub enable_smart_invalidation: bool,

    /// Queue requests and flush them in batches
    pub enable_batch_invalidation: bool,

    /// Queue length that triggers a flush
    pub batch_size: usize,

    /// Flush interval for partially filled batches
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,

    /// Maximum cascade expansions (and related-change levels)
    pub max_dependency_depth: usize,

    /// Minimum similarity for fuzzy identifier matches
    pub fuzzy_threshold: f64,

    /// Keys invalidated by the conservative strategy
    pub conservative_sample_size: usize,

    /// Number of reports kept in the history ring
    pub history_size: usize,

    /// Capacity of the request channel
    pub channel_capacity: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            namespace: "queries".to_string(),
            enable_smart_invalidation: true,
            enable_batch_invalidation: false,
            batch_size: 50,
            batch_interval: Duration::from_secs(1),
            max_dependency_depth: 5,
            fuzzy_threshold: 0.8,
            conservative_sample_size: 10,
            history_size: 100,
            channel_capacity: 1024,
        }
    }
}

/// Kind of data change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    SchemaChange,
    BulkUpdate,
    SingleUpdate,
    Insert,
    Delete,
    Other,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaChange => "schema_change",
            Self::BulkUpdate => "bulk_update",
            Self::SingleUpdate => "single_update",
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

/// Description of a data change driving smart invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeContext {
    pub change_type: ChangeType,

    /// Table affected by the change
    #[serde(default)]
    pub scope: Option<String>,

    /// Identifier of the changed record
    #[serde(default)]
    pub identifier: Option<String>,

    /// Follow-up changes caused by this one
    #[serde(default)]
    pub related_changes: Vec<ChangeContext>,
}

impl ChangeContext {
    pub fn new(change_type: ChangeType) -> Self {
        Self {
            change_type,
            scope: None,
            identifier: None,
            related_changes: Vec::new(),
        }
    }

    pub fn with_scope(mut self, table: impl Into<String>) -> Self {
        self.scope = Some(table.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_related(mut self, related: ChangeContext) -> Self {
        self.related_changes.push(related);
        self
    }
}

/// Risk classification of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Strategy chosen for a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStrategy {
    /// Sampled exact matches only
    Conservative,
    /// Exact matches within the scope
    Selective,
    /// Fuzzy matches and the whole scope, cascading
    Aggressive,
}

impl InvalidationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Selective => "selective",
            Self::Aggressive => "aggressive",
        }
    }
}

/// Result of analyzing a change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub risk_level: RiskLevel,
    pub strategy: InvalidationStrategy,
    /// Tracked keys the strategy may touch before sampling
    pub candidate_keys: usize,
    /// Scope table and the tables derived from it
    pub affected_tables: Vec<String>,
}

/// Kind of invalidation performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    Table,
    Data,
    Keys,
    Smart,
}

/// Outcome of one invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationReport {
    pub id: String,
    pub kind: InvalidationKind,
    /// Tables, identifiers or keys the invalidation was asked for
    pub targets: Vec<String>,
    /// Keys removed from the backend
    pub affected_keys: Vec<String>,
    /// Keys the backend failed to delete
    pub failed_keys: Vec<String>,
    /// Cascade expansions performed
    pub cascade_depth: usize,
    pub duration_ms: u64,
}

impl InvalidationReport {
    pub fn affected_count(&self) -> usize {
        self.affected_keys.len()
    }

    /// Whether every key was removed
    pub fn is_complete(&self) -> bool {
        self.failed_keys.is_empty()
    }
}

/// Request accepted by the invalidator, directly or through the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationRequest {
    Table { tables: Vec<String>, cascade: bool },
    Data { identifiers: Vec<String>, fuzzy: bool },
    Keys { keys: Vec<String> },
    Smart { change: ChangeContext },
}

/// Producer handle for the invalidation channel
#[derive(Debug, Clone)]
pub struct InvalidationSender {
    tx: mpsc::Sender<InvalidationRequest>,
}

impl InvalidationSender {
    /// Queue a request, waiting for channel capacity
    pub async fn send(&self, request: InvalidationRequest) -> EngineResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::invalidation("invalidation channel is closed"))
    }

    /// Queue a request without waiting
    pub fn try_send(&self, request: InvalidationRequest) -> EngineResult<()> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::invalidation("invalidation channel is full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::invalidation("invalidation channel is closed")
            }
        })
    }

    /// Queue a table invalidation
    pub async fn invalidate_table(&self, table: impl Into<String>, cascade: bool) -> EngineResult<()> {
        self.send(InvalidationRequest::Table {
            tables: vec![table.into()],
            cascade,
        })
        .await
    }
}

/// Invalidation statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationStats {
    pub operations: u64,
    pub keys_invalidated: u64,
    pub failed_keys: u64,
    pub batches_flushed: u64,
    pub queued_requests: usize,
    pub average_duration_ms: f64,
    pub tracked_keys: usize,
    pub tracked_tables: usize,
}

#[derive(Debug, Default)]
struct Counters {
    operations: AtomicU64,
    keys_invalidated: AtomicU64,
    failed_keys: AtomicU64,
    batches_flushed: AtomicU64,
    total_duration_ms: AtomicU64,
}

/// Dependency-graph invalidator
pub struct QueryInvalidator {
    config: InvalidationConfig,
    backend: Arc<dyn CacheBackend>,
    graph: RwLock<DependencyGraph>,

    /// Requests waiting for the next batch flush
    queue: Mutex<Vec<InvalidationRequest>>,

    /// Recent reports, oldest first
    history: Mutex<VecDeque<InvalidationReport>>,

    sender: mpsc::Sender<InvalidationRequest>,
    receiver: Mutex<Option<mpsc::Receiver<InvalidationRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,

    events: EventBus,
    metrics: CacheMetrics,
    counters: Counters,
}

impl QueryInvalidator {
    /// Create an invalidator. Call [`QueryInvalidator::start`] to consume the request channel
    /// and run the batch timer.
    pub fn new(
        config: InvalidationConfig,
        backend: Arc<dyn CacheBackend>,
        events: EventBus,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));

        Arc::new(Self {
            config,
            backend,
            graph: RwLock::new(DependencyGraph::new()),
            queue: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            events,
            metrics: CacheMetrics,
            counters: Counters::default(),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &InvalidationConfig {
        &self.config
    }

    /// Producer handle for the request channel
    pub fn sender(&self) -> InvalidationSender {
        InvalidationSender {
            tx: self.sender.clone(),
        }
    }

    /// Start the channel consumer and, with batching enabled, the batch timer.
    /// Calling it more than once has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };

        let mut tasks = self.tasks.lock();

        let invalidator = Arc::clone(self);
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    request = receiver.recv() => match request {
                        Some(request) => {
                            invalidator.submit(request).await;
                        }
                        None => break,
                    },
                }
            }

            // requests already sent must not be lost
            receiver.close();
            while let Ok(request) = receiver.try_recv() {
                invalidator.submit(request).await;
            }
        }));

        if self.config.enable_batch_invalidation {
            let invalidator = Arc::clone(self);
            let token = self.shutdown.clone();
            let period = self.config.batch_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            invalidator.flush().await;
                        }
                    }
                }
            }));
        }

        info!(
            "Query invalidator started (batching: {}, depth limit: {})",
            self.config.enable_batch_invalidation, self.config.max_dependency_depth
        );
    }

    /// Stop background tasks, drain the channel and flush queued requests
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Invalidation task ended abnormally: {}", e);
            }
        }

        let flushed = self.flush().await;
        info!(
            "Query invalidator stopped, flushed {} pending invalidations",
            flushed.len()
        );
    }

    // ---- dependency registration ----

    /// Record the tables a cached query reads
    pub fn register_query<I>(&self, key: &str, tables: I, label: impl Into<String>)
    where
        I: IntoIterator<Item = String>,
    {
        self.graph.write().register_query(key, tables, label);
    }

    /// Record that `dependent` is derived from `parent`
    pub fn register_key_dependency(&self, parent: &str, dependent: &str) {
        self.graph.write().register_key_dependency(parent, dependent);
    }

    /// Record that table `derived` is computed from table `source`
    pub fn register_table_dependency(&self, source: &str, derived: &str) {
        self.graph.write().register_table_dependency(source, derived);
    }

    /// Drop a key from the graph without touching the backend
    pub fn forget_key(&self, key: &str) -> bool {
        self.graph.write().remove_key(key)
    }

    /// Keys recorded against a table
    pub fn keys_for_table(&self, table: &str) -> Vec<String> {
        self.graph.read().keys_for_table(table)
    }

    /// Whether a key is tracked
    pub fn is_tracked(&self, key: &str) -> bool {
        self.graph.read().contains_key(key)
    }

    // ---- direct invalidation ----

    /// Invalidate the dependents of a table
    pub async fn invalidate_table(&self, table: &str, cascade: bool) -> InvalidationReport {
        self.invalidate_tables(&[table.to_string()], cascade).await
    }

    /// Invalidate the dependents of several tables in one pass
    pub async fn invalidate_tables(&self, tables: &[String], cascade: bool) -> InvalidationReport {
        let started = Instant::now();
        let (keys, depth) = self.collect_cascade(tables, Vec::new(), cascade);
        let (deleted, failed) = self.delete_keys(&keys).await;

        let report = self.finish(InvalidationKind::Table, tables.to_vec(), deleted, failed, depth, started);
        debug!(
            "Invalidated {} keys for tables {:?} (cascade depth {})",
            report.affected_count(),
            tables,
            depth
        );
        self.events.emit(CacheEvent::TableInvalidated {
            operation_id: report.id.clone(),
            tables: tables.to_vec(),
            keys: report.affected_keys.clone(),
            affected_keys: report.affected_count(),
            cascade_depth: depth,
            duration_ms: report.duration_ms,
        });
        report
    }

    /// Invalidate keys whose label contains (or fuzzily matches) any identifier
    pub async fn invalidate_data(&self, identifiers: &[String], fuzzy: bool) -> InvalidationReport {
        let started = Instant::now();
        let keys = self.match_identifiers(identifiers, fuzzy, None);
        let (deleted, failed) = self.delete_keys(&keys).await;

        let report = self.finish(InvalidationKind::Data, identifiers.to_vec(), deleted, failed, 0, started);
        self.events.emit(CacheEvent::DataInvalidated {
            operation_id: report.id.clone(),
            identifiers: identifiers.to_vec(),
            keys: report.affected_keys.clone(),
            affected_keys: report.affected_count(),
            fuzzy,
            duration_ms: report.duration_ms,
        });
        report
    }

    /// Invalidate specific keys
    pub async fn invalidate_keys(&self, keys: &[String]) -> InvalidationReport {
        let started = Instant::now();
        let (deleted, failed) = self.delete_keys(keys).await;

        let report = self.finish(InvalidationKind::Keys, keys.to_vec(), deleted, failed, 0, started);
        self.events.emit(CacheEvent::DataInvalidated {
            operation_id: report.id.clone(),
            identifiers: keys.to_vec(),
            keys: report.affected_keys.clone(),
            affected_keys: report.affected_count(),
            fuzzy: false,
            duration_ms: report.duration_ms,
        });
        report
    }

    // ---- smart invalidation ----

    /// Classify a change and pick the strategy for it
    pub fn analyze_impact(&self, change: &ChangeContext) -> ImpactAnalysis {
        let risk_level = match change.change_type {
            ChangeType::SchemaChange | ChangeType::BulkUpdate => RiskLevel::High,
            ChangeType::SingleUpdate => RiskLevel::Medium,
            _ => RiskLevel::Low,
        };

        let strategy = if !self.config.enable_smart_invalidation {
            InvalidationStrategy::Aggressive
        } else {
            match risk_level {
                RiskLevel::High => InvalidationStrategy::Aggressive,
                RiskLevel::Medium => InvalidationStrategy::Selective,
                RiskLevel::Low => InvalidationStrategy::Conservative,
            }
        };

        let mut affected_tables = Vec::new();
        if let Some(scope) = &change.scope {
            affected_tables.push(scope.clone());
            affected_tables.extend(self.graph.read().dependent_tables(scope));
        }

        let candidate_keys = match strategy {
            InvalidationStrategy::Aggressive => {
                let fuzzy = self.match_identifiers(identifier_list(change).as_slice(), true, None);
                let scope: Vec<String> = change.scope.iter().cloned().collect();
                self.collect_cascade(&scope, fuzzy, true).0.len()
            }
            _ => self.scoped_exact_matches(change).len(),
        };

        ImpactAnalysis {
            risk_level,
            strategy,
            candidate_keys,
            affected_tables,
        }
    }

    /// Invalidate according to the impact analysis of a change and its related changes
    pub async fn smart_invalidate(&self, change: &ChangeContext) -> InvalidationReport {
        let started = Instant::now();
        let root = self.analyze_impact(change);

        let mut pending: VecDeque<(ChangeContext, usize)> = VecDeque::new();
        pending.push_back((change.clone(), 0));
        let mut seen: HashSet<ChangeContext> = HashSet::new();

        let mut all_deleted = Vec::new();
        let mut all_failed = Vec::new();
        let mut max_depth = 0;

        while let Some((current, level)) = pending.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }

            let analysis = self.analyze_impact(&current);
            let (keys, depth) = self.keys_for_strategy(&current, analysis.strategy);
            let (deleted, failed) = self.delete_keys(&keys).await;
            debug!(
                "Smart invalidation of {} change ({} risk, {} strategy) removed {} keys",
                current.change_type.as_str(),
                analysis.risk_level.as_str(),
                analysis.strategy.as_str(),
                deleted.len()
            );

            all_deleted.extend(deleted);
            all_failed.extend(failed);
            max_depth = max_depth.max(depth);

            if current.related_changes.is_empty() {
                continue;
            }
            if level < self.config.max_dependency_depth {
                for related in &current.related_changes {
                    pending.push_back((related.clone(), level + 1));
                }
            } else {
                warn!(
                    "Dropping {} related changes beyond depth {}",
                    current.related_changes.len(),
                    self.config.max_dependency_depth
                );
            }
        }

        let mut targets: Vec<String> = change.scope.iter().cloned().collect();
        targets.extend(change.identifier.iter().cloned());
        let report = self.finish(
            InvalidationKind::Smart,
            targets,
            dedup(all_deleted),
            dedup(all_failed),
            max_depth,
            started,
        );

        self.events.emit(CacheEvent::SmartInvalidationCompleted {
            operation_id: report.id.clone(),
            change_type: change.change_type.as_str().to_string(),
            risk_level: root.risk_level.as_str().to_string(),
            strategy: root.strategy.as_str().to_string(),
            keys: report.affected_keys.clone(),
            affected_keys: report.affected_count(),
            duration_ms: report.duration_ms,
        });
        report
    }

    // ---- batching ----

    /// Execute a request now, or queue it when batching is enabled.
    /// Returns the reports of whatever ran.
    pub async fn submit(&self, request: InvalidationRequest) -> Vec<InvalidationReport> {
        if !self.config.enable_batch_invalidation {
            return vec![self.execute(request).await];
        }

        let should_flush = {
            let mut queue = self.queue.lock();
            queue.push(request);
            queue.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush().await
        } else {
            Vec::new()
        }
    }

    /// Run every queued request, merging requests with identical metadata
    pub async fn flush(&self) -> Vec<InvalidationReport> {
        let pending = std::mem::take(&mut *self.queue.lock());
        if pending.is_empty() {
            return Vec::new();
        }

        let received = pending.len();
        let grouped = group_requests(pending);
        debug!(
            "Flushing invalidation batch: {} requests merged into {}",
            received,
            grouped.len()
        );

        let mut reports = Vec::with_capacity(grouped.len());
        for request in grouped {
            reports.push(self.execute(request).await);
        }
        self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
        reports
    }

    /// Number of queued requests
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    async fn execute(&self, request: InvalidationRequest) -> InvalidationReport {
        match request {
            InvalidationRequest::Table { tables, cascade } => {
                self.invalidate_tables(&tables, cascade).await
            }
            InvalidationRequest::Data { identifiers, fuzzy } => {
                self.invalidate_data(&identifiers, fuzzy).await
            }
            InvalidationRequest::Keys { keys } => self.invalidate_keys(&keys).await,
            InvalidationRequest::Smart { change } => self.smart_invalidate(&change).await,
        }
    }

    // ---- reporting ----

    /// Recent reports, oldest first
    pub fn history(&self) -> Vec<InvalidationReport> {
        self.history.lock().iter().cloned().collect()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> InvalidationStats {
        let operations = self.counters.operations.load(Ordering::Relaxed);
        let total_ms = self.counters.total_duration_ms.load(Ordering::Relaxed);
        let graph = self.graph.read();

        InvalidationStats {
            operations,
            keys_invalidated: self.counters.keys_invalidated.load(Ordering::Relaxed),
            failed_keys: self.counters.failed_keys.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            queued_requests: self.queue.lock().len(),
            average_duration_ms: if operations > 0 {
                total_ms as f64 / operations as f64
            } else {
                0.0
            },
            tracked_keys: graph.key_count(),
            tracked_tables: graph.table_count(),
        }
    }

    // ---- internals ----

    /// Breadth-first walk from seed tables and keys. Level 0 holds the direct dependents; each
    /// further level is one cascade expansion, at most `max_dependency_depth` of them.
    fn collect_cascade(
        &self,
        seed_tables: &[String],
        seed_keys: Vec<String>,
        cascade: bool,
    ) -> (Vec<String>, usize) {
        let graph = self.graph.read();
        let mut visited_tables: HashSet<String> = HashSet::new();
        let mut visited_keys: HashSet<String> = HashSet::new();
        let mut ordered = Vec::new();

        let mut frontier_tables: Vec<String> = seed_tables.to_vec();
        let mut frontier_keys = seed_keys;
        let mut depth = 0;

        loop {
            let mut level_tables = Vec::new();
            let mut level_keys = Vec::new();

            for table in frontier_tables.drain(..) {
                if !visited_tables.insert(table.clone()) {
                    continue;
                }
                for key in graph.keys_for_table(&table) {
                    if visited_keys.insert(key.clone()) {
                        level_keys.push(key);
                    }
                }
                level_tables.push(table);
            }
            for key in frontier_keys.drain(..) {
                if visited_keys.insert(key.clone()) {
                    level_keys.push(key);
                }
            }
            ordered.extend(level_keys.iter().cloned());

            if !cascade || depth >= self.config.max_dependency_depth {
                break;
            }

            let next_keys: Vec<String> = level_keys
                .iter()
                .flat_map(|key| graph.dependent_keys(key))
                .filter(|key| !visited_keys.contains(key))
                .collect();
            let next_tables: Vec<String> = level_tables
                .iter()
                .flat_map(|table| graph.dependent_tables(table))
                .filter(|table| !visited_tables.contains(table))
                .collect();
            if next_keys.is_empty() && next_tables.is_empty() {
                break;
            }

            depth += 1;
            frontier_keys = next_keys;
            frontier_tables = next_tables;
        }

        (ordered, depth)
    }

    fn match_identifiers(
        &self,
        identifiers: &[String],
        fuzzy: bool,
        restrict_to: Option<&HashSet<String>>,
    ) -> Vec<String> {
        let needles: Vec<String> = identifiers
            .iter()
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty())
            .collect();
        if needles.is_empty() {
            return Vec::new();
        }

        let threshold = self.config.fuzzy_threshold;
        let graph = self.graph.read();
        let mut matches: Vec<String> = graph
            .labels()
            .filter(|(key, _)| restrict_to.map_or(true, |allowed| allowed.contains(*key)))
            .filter(|(_, label)| {
                let label = label.to_lowercase();
                needles.iter().any(|needle| {
                    label.contains(needle.as_str())
                        || (fuzzy
                            && label
                                .split(|c: char| !(c.is_alphanumeric() || c == '_'))
                                .filter(|token| !token.is_empty())
                                .any(|token| similarity(needle, token) >= threshold))
                })
            })
            .map(|(key, _)| key.clone())
            .collect();
        matches.sort();
        matches
    }

    /// Exact identifier matches limited to the scope table, or the scope's keys when no
    /// identifier is given
    fn scoped_exact_matches(&self, change: &ChangeContext) -> Vec<String> {
        let scope_keys: Option<HashSet<String>> = change
            .scope
            .as_ref()
            .map(|table| self.graph.read().keys_for_table(table).into_iter().collect());

        match (&change.identifier, scope_keys) {
            (Some(identifier), scope_keys) => {
                self.match_identifiers(&[identifier.clone()], false, scope_keys.as_ref())
            }
            (None, Some(scope_keys)) => {
                let mut keys: Vec<String> = scope_keys.into_iter().collect();
                keys.sort();
                keys
            }
            (None, None) => Vec::new(),
        }
    }

    fn keys_for_strategy(
        &self,
        change: &ChangeContext,
        strategy: InvalidationStrategy,
    ) -> (Vec<String>, usize) {
        match strategy {
            InvalidationStrategy::Aggressive => {
                let fuzzy = self.match_identifiers(identifier_list(change).as_slice(), true, None);
                let scope: Vec<String> = change.scope.iter().cloned().collect();
                self.collect_cascade(&scope, fuzzy, true)
            }
            InvalidationStrategy::Selective => (self.scoped_exact_matches(change), 0),
            InvalidationStrategy::Conservative => {
                let mut keys = self.scoped_exact_matches(change);
                keys.truncate(self.config.conservative_sample_size);
                (keys, 0)
            }
        }
    }

    /// Delete keys from the backend. Only keys that were present count as deleted; keys that
    /// had already expired are still dropped from the graph.
    async fn delete_keys(&self, keys: &[String]) -> (Vec<String>, Vec<String>) {
        let mut deleted = Vec::with_capacity(keys.len());
        let mut gone = Vec::new();
        let mut failed = Vec::new();

        for key in keys {
            match self.backend.delete(&self.config.namespace, key).await {
                Ok(true) => deleted.push(key.clone()),
                Ok(false) => gone.push(key.clone()),
                Err(e) => {
                    warn!("Failed to invalidate cache key {}: {}", key, e);
                    self.metrics.record_backend_error("invalidate");
                    failed.push(key.clone());
                }
            }
        }

        if !deleted.is_empty() || !gone.is_empty() {
            let mut graph = self.graph.write();
            for key in deleted.iter().chain(&gone) {
                graph.remove_key(key);
            }
        }

        (deleted, failed)
    }

    fn finish(
        &self,
        kind: InvalidationKind,
        targets: Vec<String>,
        deleted: Vec<String>,
        failed: Vec<String>,
        cascade_depth: usize,
        started: Instant,
    ) -> InvalidationReport {
        let elapsed = started.elapsed();
        let report = InvalidationReport {
            id: new_operation_id(),
            kind,
            targets,
            affected_keys: deleted,
            failed_keys: failed,
            cascade_depth,
            duration_ms: elapsed.as_millis() as u64,
        };

        self.counters.operations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .keys_invalidated
            .fetch_add(report.affected_keys.len() as u64, Ordering::Relaxed);
        self.counters
            .failed_keys
            .fetch_add(report.failed_keys.len() as u64, Ordering::Relaxed);
        self.counters
            .total_duration_ms
            .fetch_add(report.duration_ms, Ordering::Relaxed);

        let kind_label = match kind {
            InvalidationKind::Table => "table",
            InvalidationKind::Data => "data",
            InvalidationKind::Keys => "keys",
            InvalidationKind::Smart => "smart",
        };
        self.metrics
            .record_invalidation(kind_label, report.affected_keys.len(), elapsed);

        if !report.failed_keys.is_empty() {
            self.events.emit(CacheEvent::error(
                "invalidation",
                format!(
                    "{} invalidation {} left {} keys in place",
                    kind_label,
                    report.id,
                    report.failed_keys.len()
                ),
            ));
        }

        let mut history = self.history.lock();
        history.push_back(report.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }

        report
    }
}

fn identifier_list(change: &ChangeContext) -> Vec<String> {
    change.identifier.iter().cloned().collect()
}

fn dedup(keys: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// Merge requests that share metadata: tables per cascade flag, identifiers per fuzzy flag,
/// all key lists, and identical smart changes
fn group_requests(requests: Vec<InvalidationRequest>) -> Vec<InvalidationRequest> {
    let mut tables: [BTreeSet<String>; 2] = Default::default();
    let mut identifiers: [BTreeSet<String>; 2] = Default::default();
    let mut keys: BTreeSet<String> = BTreeSet::new();
    let mut changes: Vec<ChangeContext> = Vec::new();

    for request in requests {
        match request {
            InvalidationRequest::Table { tables: t, cascade } => {
                tables[cascade as usize].extend(t);
            }
            InvalidationRequest::Data {
                identifiers: ids,
                fuzzy,
            } => {
                identifiers[fuzzy as usize].extend(ids);
            }
            InvalidationRequest::Keys { keys: k } => keys.extend(k),
            InvalidationRequest::Smart { change } => {
                if !changes.contains(&change) {
                    changes.push(change);
                }
            }
        }
    }

    let mut grouped = Vec::new();
    for (flag, set) in tables.into_iter().enumerate() {
        if !set.is_empty() {
            grouped.push(InvalidationRequest::Table {
                tables: set.into_iter().collect(),
                cascade: flag == 1,
            });
        }
    }
    for (flag, set) in identifiers.into_iter().enumerate() {
        if !set.is_empty() {
            grouped.push(InvalidationRequest::Data {
                identifiers: set.into_iter().collect(),
                fuzzy: flag == 1,
            });
        }
    }
    if !keys.is_empty() {
        grouped.push(InvalidationRequest::Keys {
            keys: keys.into_iter().collect(),
        });
    }
    grouped.extend(
        changes
            .into_iter()
            .map(|change| InvalidationRequest::Smart { change }),
    );
    grouped
}

/// Levenshtein distance over characters
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous + usize::from(ca != cb);
            previous = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(previous + 1);
        }
    }
    row[b.len()]
}

/// Similarity in `[0, 1]`: one minus the edit distance over the longer length
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::{InMemoryBackend, InMemoryBackendConfig};

    async fn create_test_invalidator(
        config: InvalidationConfig,
    ) -> (Arc<QueryInvalidator>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let invalidator = QueryInvalidator::new(config, backend.clone(), EventBus::default());
        (invalidator, backend)
    }

    async fn cache_query(
        invalidator: &QueryInvalidator,
        backend: &InMemoryBackend,
        key: &str,
        tables: &[&str],
        label: &str,
    ) {
        backend
            .set("queries", key, b"rows", Duration::from_secs(60), &[])
            .await
            .unwrap();
        invalidator.register_query(key, tables.iter().map(|t| t.to_string()), label);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("customer", "customer"), 1.0);
        assert!(similarity("customer_42", "customer_43") >= 0.8);
        assert!(similarity("orders", "users") < 0.8);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[tokio::test]
    async fn test_table_invalidation_is_idempotent() {
        let (invalidator, backend) = create_test_invalidator(InvalidationConfig::default()).await;
        cache_query(&invalidator, &backend, "q1", &["orders"], "select * from orders").await;
        cache_query(&invalidator, &backend, "q2", &["users"], "select * from users").await;

        let report = invalidator.invalidate_table("orders", false).await;
        assert_eq!(report.affected_keys, vec!["q1".to_string()]);
        assert!(report.is_complete());
        assert!(backend.get("queries", "q1").await.unwrap().is_none());
        assert!(backend.get("queries", "q2").await.unwrap().is_some());
        assert!(invalidator.keys_for_table("orders").is_empty());

        let again = invalidator.invalidate_table("orders", false).await;
        assert_eq!(again.affected_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_keys_are_untracked_but_not_counted() {
        let (invalidator, backend) = create_test_invalidator(InvalidationConfig::default()).await;
        cache_query(&invalidator, &backend, "live", &["orders"], "select live orders").await;
        invalidator.register_query("expired", ["orders".to_string()], "select old orders");

        let report = invalidator.invalidate_table("orders", false).await;

        assert_eq!(report.affected_keys, vec!["live".to_string()]);
        assert!(report.is_complete());
        assert!(!invalidator.is_tracked("expired"));
        assert!(invalidator.keys_for_table("orders").is_empty());
    }

    #[tokio::test]
    async fn test_cascade_follows_dependent_keys() {
        let (invalidator, backend) = create_test_invalidator(InvalidationConfig::default()).await;
        cache_query(&invalidator, &backend, "orders_q", &["orders"], "orders").await;
        cache_query(&invalidator, &backend, "report_q", &["reports"], "report").await;
        invalidator.register_key_dependency("orders_q", "report_q");

        let shallow = invalidator.invalidate_table("orders", false).await;
        assert_eq!(shallow.affected_count(), 1);
        assert!(backend.get("queries", "report_q").await.unwrap().is_some());

        cache_query(&invalidator, &backend, "orders_q", &["orders"], "orders").await;
        invalidator.register_key_dependency("orders_q", "report_q");

        let deep = invalidator.invalidate_table("orders", true).await;
        assert_eq!(deep.affected_count(), 2);
        assert_eq!(deep.cascade_depth, 1);
        assert!(backend.get("queries", "report_q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascade_terminates_on_cycles() {
        let (invalidator, backend) = create_test_invalidator(InvalidationConfig::default()).await;
        cache_query(&invalidator, &backend, "a_q", &["a"], "a").await;
        cache_query(&invalidator, &backend, "b_q", &["b"], "b").await;
        invalidator.register_table_dependency("a", "b");
        invalidator.register_table_dependency("b", "a");
        invalidator.register_key_dependency("a_q", "b_q");
        invalidator.register_key_dependency("b_q", "a_q");

        let report = invalidator.invalidate_table("a", true).await;
        assert_eq!(report.affected_count(), 2);
        assert!(report.cascade_depth <= invalidator.config().max_dependency_depth);
    }

    #[tokio::test]
    async fn test_cascade_depth_is_bounded() {
        let config = InvalidationConfig {
            max_dependency_depth: 3,
            ..Default::default()
        };
        let (invalidator, backend) = create_test_invalidator(config).await;

        for i in 0..10 {
            let key = format!("k{}", i);
            cache_query(&invalidator, &backend, &key, &[&format!("t{}", i)], &key).await;
            if i > 0 {
                invalidator.register_key_dependency(&format!("k{}", i - 1), &key);
            }
        }

        let report = invalidator.invalidate_table("t0", true).await;
        assert_eq!(report.cascade_depth, 3);
        // direct dependents plus three expansions
        assert_eq!(report.affected_count(), 4);
        assert!(backend.get("queries", "k4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_data_invalidation_exact_and_fuzzy() {
        let (invalidator, backend) = create_test_invalidator(InvalidationConfig::default()).await;
        cache_query(
            &invalidator,
            &backend,
            "c42",
            &["customers"],
            "select * from customers where code = ? [\"customer_42\"]",
        )
        .await;
        cache_query(
            &invalidator,
            &backend,
            "c77",
            &["customers"],
            "select * from customers where code = ? [\"customer_77\"]",
        )
        .await;

        let exact = invalidator
            .invalidate_data(&["CUSTOMER_42".to_string()], false)
            .await;
        assert_eq!(exact.affected_keys, vec!["c42".to_string()]);

        let none = invalidator
            .invalidate_data(&["customer_78".to_string()], false)
            .await;
        assert_eq!(none.affected_count(), 0);

        let fuzzy = invalidator
            .invalidate_data(&["customer_78".to_string()], true)
            .await;
        assert_eq!(fuzzy.affected_keys, vec!["c77".to_string()]);
    }

    #[tokio::test]
    async fn test_impact_analysis_risk_levels() {
        let (invalidator, _backend) = create_test_invalidator(InvalidationConfig::default()).await;

        let schema = invalidator.analyze_impact(&ChangeContext::new(ChangeType::SchemaChange));
        assert_eq!(schema.risk_level, RiskLevel::High);
        assert_eq!(schema.strategy, InvalidationStrategy::Aggressive);

        let single = invalidator.analyze_impact(&ChangeContext::new(ChangeType::SingleUpdate));
        assert_eq!(single.risk_level, RiskLevel::Medium);
        assert_eq!(single.strategy, InvalidationStrategy::Selective);

        let insert = invalidator.analyze_impact(&ChangeContext::new(ChangeType::Insert));
        assert_eq!(insert.risk_level, RiskLevel::Low);
        assert_eq!(insert.strategy, InvalidationStrategy::Conservative);
    }

    #[tokio::test]
    async fn test_smart_invalidation_strategies() {
        let config = InvalidationConfig {
            conservative_sample_size: 2,
            ..Default::default()
        };
        let (invalidator, backend) = create_test_invalidator(config).await;
        for i in 0..5 {
            let key = format!("o{}", i);
            cache_query(&invalidator, &backend, &key, &["orders"], &format!("orders [{}]", i)).await;
        }

        // low risk touches a bounded sample
        let conservative = invalidator
            .smart_invalidate(&ChangeContext::new(ChangeType::Insert).with_scope("orders"))
            .await;
        assert_eq!(conservative.affected_count(), 2);

        // medium risk only touches exact matches in scope
        let selective = invalidator
            .smart_invalidate(
                &ChangeContext::new(ChangeType::SingleUpdate)
                    .with_scope("orders")
                    .with_identifier("[3]"),
            )
            .await;
        assert_eq!(selective.affected_keys, vec!["o3".to_string()]);

        // high risk clears the table
        let aggressive = invalidator
            .smart_invalidate(&ChangeContext::new(ChangeType::BulkUpdate).with_scope("orders"))
            .await;
        assert_eq!(aggressive.affected_count(), 2);
        assert!(invalidator.keys_for_table("orders").is_empty());
    }

    #[tokio::test]
    async fn test_smart_invalidation_follows_related_changes() {
        let (invalidator, backend) = create_test_invalidator(InvalidationConfig::default()).await;
        cache_query(&invalidator, &backend, "o", &["orders"], "orders").await;
        cache_query(&invalidator, &backend, "i", &["inventory"], "inventory").await;

        let change = ChangeContext::new(ChangeType::BulkUpdate)
            .with_scope("orders")
            .with_related(ChangeContext::new(ChangeType::BulkUpdate).with_scope("inventory"));

        let report = invalidator.smart_invalidate(&change).await;
        assert_eq!(report.affected_count(), 2);
        assert_eq!(report.kind, InvalidationKind::Smart);
    }

    #[tokio::test]
    async fn test_batching_groups_requests() {
        let config = InvalidationConfig {
            enable_batch_invalidation: true,
            batch_size: 3,
            ..Default::default()
        };
        let (invalidator, backend) = create_test_invalidator(config).await;
        cache_query(&invalidator, &backend, "q1", &["orders"], "orders").await;
        cache_query(&invalidator, &backend, "q2", &["users"], "users").await;

        let table = |t: &str| InvalidationRequest::Table {
            tables: vec![t.to_string()],
            cascade: false,
        };

        assert!(invalidator.submit(table("orders")).await.is_empty());
        assert!(invalidator.submit(table("orders")).await.is_empty());
        assert_eq!(invalidator.queued(), 2);

        let reports = invalidator.submit(table("users")).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].affected_count(), 2);
        assert_eq!(invalidator.queued(), 0);
        assert_eq!(invalidator.stats().batches_flushed, 1);
    }

    #[tokio::test]
    async fn test_group_requests_merges_metadata() {
        let grouped = group_requests(vec![
            InvalidationRequest::Table {
                tables: vec!["a".into()],
                cascade: true,
            },
            InvalidationRequest::Table {
                tables: vec!["b".into()],
                cascade: false,
            },
            InvalidationRequest::Table {
                tables: vec!["a".into(), "c".into()],
                cascade: true,
            },
            InvalidationRequest::Smart {
                change: ChangeContext::new(ChangeType::Insert),
            },
            InvalidationRequest::Smart {
                change: ChangeContext::new(ChangeType::Insert),
            },
        ]);

        assert_eq!(grouped.len(), 3);
        assert!(grouped.contains(&InvalidationRequest::Table {
            tables: vec!["a".into(), "c".into()],
            cascade: true,
        }));
    }

    #[tokio::test]
    async fn test_channel_requests_are_flushed_on_shutdown() {
        let config = InvalidationConfig {
            enable_batch_invalidation: true,
            batch_size: 100,
            batch_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (invalidator, backend) = create_test_invalidator(config).await;
        cache_query(&invalidator, &backend, "q1", &["orders"], "orders").await;

        invalidator.start();
        invalidator
            .sender()
            .invalidate_table("orders", false)
            .await
            .unwrap();

        invalidator.shutdown().await;
        assert!(backend.get("queries", "q1").await.unwrap().is_none());
        assert_eq!(invalidator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = InvalidationConfig {
            history_size: 3,
            ..Default::default()
        };
        let (invalidator, _backend) = create_test_invalidator(config).await;
        for i in 0..5 {
            invalidator.invalidate_table(&format!("t{}", i), false).await;
        }
        let history = invalidator.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].targets, vec!["t2".to_string()]);
        assert_eq!(invalidator.stats().operations, 5);
    }
}
