//! # Cache Validator
//!
//! Integrity checking and repair for stored entries.
//!
//! [`CacheValidator::validate`] runs a list of [`ValidationRule`]s against one key and reports
//! a diagnostic per rule. [`CacheValidator::validate_integrity`] samples keys from each tier
//! (backend namespace) and classifies the tier by the share of valid entries:
//! healthy at or above `healthy_threshold` (0.95), degraded at or above `degraded_threshold`
//! (0.80), unhealthy below. [`CacheValidator::repair_cache`] backs invalid entries up to a
//! long-TTL namespace, then reloads them from a [`SourceLoader`] or deletes them.
//!
//! Validation failures are reported, never raised: only backend failures that prevent the
//! check from running at all surface as errors.

use super::entry::CacheEntry;
use super::events::{new_operation_id, CacheEvent, EventBus};
use super::stores::CacheBackend;
use crate::core::error::EngineResult;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Keys sampled per tier by the integrity check
    pub sample_size: usize,

    /// Namespaces checked by the integrity check
    pub tiers: Vec<String>,

    /// Minimum valid ratio for a healthy tier
    pub healthy_threshold: f64,

    /// Minimum valid ratio for a degraded tier
    pub degraded_threshold: f64,

    /// Namespace receiving backups before repair
    pub backup_namespace: String,

    /// TTL of backups
    #[serde(with = "humantime_serde")]
    pub backup_ttl: Duration,

    /// Interval of the background integrity check
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Run the background integrity check
    pub enable_health_monitor: bool,

    /// Entries larger than this fail the default size rule
    pub max_entry_size: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            sample_size: 100,
            tiers: vec!["responses".to_string(), "queries".to_string()],
            healthy_threshold: 0.95,
            degraded_threshold: 0.80,
            backup_namespace: "backup".to_string(),
            backup_ttl: Duration::from_secs(7 * 24 * 3600),
            health_check_interval: Duration::from_secs(300),
            enable_health_monitor: false,
            max_entry_size: 1024 * 1024,
        }
    }
}

/// JSON value kinds for [`ValidationRule::ExpectedType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonType {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

impl JsonType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Object(_) => Self::Object,
            Value::Array(_) => Self::Array,
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Bool,
            Value::Null => Self::Null,
        }
    }
}

/// Business predicate over the decoded payload
pub type BusinessPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A check applied to a stored entry
#[derive(Clone)]
pub enum ValidationRule {
    /// Payload parses as JSON
    JsonWellFormed,

    /// Payload is JSON of the given kind
    ExpectedType(JsonType),

    /// Payload is an object (or array of objects) with the required fields of the given kinds
    Schema { fields: BTreeMap<String, JsonType> },

    /// Uncompressed payload does not exceed the size
    MaxSize(usize),

    /// Entry has time left to live
    TtlRemaining,

    /// Payload matches its ETag
    Checksum,

    /// Named predicate over the JSON payload
    Business {
        name: String,
        predicate: BusinessPredicate,
    },
}

impl ValidationRule {
    /// Rule name used in diagnostics
    pub fn name(&self) -> String {
        match self {
            Self::JsonWellFormed => "json_well_formed".to_string(),
            Self::ExpectedType(_) => "expected_type".to_string(),
            Self::Schema { .. } => "schema".to_string(),
            Self::MaxSize(_) => "max_size".to_string(),
            Self::TtlRemaining => "ttl_remaining".to_string(),
            Self::Checksum => "checksum".to_string(),
            Self::Business { name, .. } => format!("business:{}", name),
        }
    }

    /// Build a business rule
    pub fn business<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::Business {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedType(kind) => write!(f, "ExpectedType({:?})", kind),
            Self::Schema { fields } => write!(f, "Schema({:?})", fields),
            Self::MaxSize(size) => write!(f, "MaxSize({})", size),
            other => f.write_str(&other.name()),
        }
    }
}

/// Outcome of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDiagnostic {
    pub rule: String,
    pub passed: bool,
    pub message: Option<String>,
}

/// Outcome of validating one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub namespace: String,
    pub key: String,
    /// The key was present in the backend
    pub exists: bool,
    pub valid: bool,
    pub diagnostics: Vec<RuleDiagnostic>,
    pub duration_ms: u64,
}

impl ValidationResult {
    /// Names of the rules that failed
    pub fn failed_rules(&self) -> Vec<String> {
        self.diagnostics
            .iter()
            .filter(|d| !d.passed)
            .map(|d| d.rule.clone())
            .collect()
    }
}

/// Tier health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Health of one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierHealth {
    pub tier: String,
    pub sampled: usize,
    pub valid: usize,
    pub valid_ratio: f64,
    pub status: HealthStatus,
    /// Sampled keys that failed validation
    pub invalid_keys: Vec<String>,
}

/// Result of an integrity check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub id: String,
    pub tiers: Vec<TierHealth>,
    /// Worst tier status
    pub overall: HealthStatus,
    pub duration_ms: u64,
}

/// Source of fresh entries for repair
#[async_trait]
pub trait SourceLoader: Send + Sync {
    /// Rebuild the entry for a key, `None` when the source has nothing for it
    async fn load(&self, namespace: &str, key: &str) -> EngineResult<Option<CacheEntry>>;
}

/// Repair options
#[derive(Debug, Clone, Copy)]
pub struct RepairOptions {
    /// Copy invalid entries to the backup namespace first
    pub backup: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self { backup: true }
    }
}

/// Result of a repair run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairReport {
    pub checked: usize,
    pub backed_up: usize,
    pub reloaded: usize,
    pub deleted: usize,
    pub failed: Vec<String>,
}

/// Integrity validator
pub struct CacheValidator {
    config: ValidatorConfig,
    backend: Arc<dyn CacheBackend>,
    events: EventBus,
}

impl CacheValidator {
    /// Create a validator over a backend
    pub fn new(config: ValidatorConfig, backend: Arc<dyn CacheBackend>, events: EventBus) -> Self {
        Self {
            config,
            backend,
            events,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Rules applied by integrity checks and repair
    pub fn default_rules(&self) -> Vec<ValidationRule> {
        vec![
            ValidationRule::TtlRemaining,
            ValidationRule::Checksum,
            ValidationRule::MaxSize(self.config.max_entry_size),
        ]
    }

    /// Validate one key against the rules
    pub async fn validate(
        &self,
        namespace: &str,
        key: &str,
        rules: &[ValidationRule],
    ) -> EngineResult<ValidationResult> {
        let started = Instant::now();
        let bytes = self.backend.get(namespace, key).await?;

        let diagnostics = match &bytes {
            None => vec![RuleDiagnostic {
                rule: "exists".to_string(),
                passed: false,
                message: Some("key not found".to_string()),
            }],
            Some(bytes) => match CacheEntry::from_bytes(bytes) {
                Ok(entry) => {
                    let remaining = self.backend.ttl(namespace, key).await?;
                    Self::check_entry(&entry, remaining, rules)
                }
                Err(e) => vec![RuleDiagnostic {
                    rule: "decode".to_string(),
                    passed: false,
                    message: Some(format!("entry does not decode: {}", e)),
                }],
            },
        };

        let result = ValidationResult {
            namespace: namespace.to_string(),
            key: key.to_string(),
            exists: bytes.is_some(),
            valid: diagnostics.iter().all(|d| d.passed),
            diagnostics,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if !result.valid {
            debug!(
                "Validation of {}/{} failed: {:?}",
                namespace,
                key,
                result.failed_rules()
            );
        }
        self.events.emit(CacheEvent::ValidationReport {
            operation_id: new_operation_id(),
            namespace: result.namespace.clone(),
            key: result.key.clone(),
            valid: result.valid,
            failed_rules: result.failed_rules(),
            duration_ms: result.duration_ms,
        });

        Ok(result)
    }

    /// Sample each tier and classify it by its share of valid entries
    pub async fn validate_integrity(
        &self,
        sample_size: usize,
        tiers: &[String],
    ) -> EngineResult<IntegrityReport> {
        let started = Instant::now();
        let rules = self.default_rules();
        let mut results = Vec::with_capacity(tiers.len());

        for tier in tiers {
            let keys = self.backend.keys(tier, "*").await?;
            let sample: Vec<String> = {
                let mut rng = rand::thread_rng();
                keys.choose_multiple(&mut rng, sample_size).cloned().collect()
            };

            let mut valid = 0;
            let mut invalid_keys = Vec::new();
            for key in &sample {
                let result = self.validate(tier, key, &rules).await?;
                // expired between listing and reading
                if !result.exists {
                    continue;
                }
                if result.valid {
                    valid += 1;
                } else {
                    invalid_keys.push(key.clone());
                }
            }

            let sampled = valid + invalid_keys.len();
            let valid_ratio = if sampled == 0 {
                1.0
            } else {
                valid as f64 / sampled as f64
            };

            results.push(TierHealth {
                tier: tier.clone(),
                sampled,
                valid,
                valid_ratio,
                status: self.classify(valid_ratio),
                invalid_keys,
            });
        }

        let overall = results
            .iter()
            .map(|t| t.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Ok(IntegrityReport {
            id: new_operation_id(),
            tiers: results,
            overall,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Back up, then reload or delete every invalid entry among `keys`
    pub async fn repair_cache(
        &self,
        namespace: &str,
        keys: &[String],
        options: RepairOptions,
        loader: Option<&dyn SourceLoader>,
    ) -> RepairReport {
        let rules = self.default_rules();
        let mut report = RepairReport::default();

        for key in keys {
            report.checked += 1;
            match self.validate(namespace, key, &rules).await {
                Ok(result) if result.valid || !result.exists => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!("Skipping repair of {}/{}: {}", namespace, key, e);
                    report.failed.push(key.clone());
                    continue;
                }
            }

            if options.backup && self.backup(namespace, key).await {
                report.backed_up += 1;
            }

            let reloaded = match loader {
                Some(loader) => self.reload(namespace, key, loader).await,
                None => false,
            };

            if reloaded {
                report.reloaded += 1;
                continue;
            }

            match self.backend.delete(namespace, key).await {
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    warn!("Failed to delete invalid entry {}/{}: {}", namespace, key, e);
                    report.failed.push(key.clone());
                }
            }
        }

        info!(
            "Repaired {}: {} checked, {} reloaded, {} deleted, {} failed",
            namespace,
            report.checked,
            report.reloaded,
            report.deleted,
            report.failed.len()
        );
        report
    }

    /// Run the integrity check on an interval until the token is cancelled, emitting an alert
    /// for every tier that is not healthy
    pub fn spawn_health_monitor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.health_check_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_health_check().await;
                    }
                }
            }
            debug!("Cache health monitor stopped");
        })
    }

    /// One health monitor round
    pub async fn run_health_check(&self) -> Option<IntegrityReport> {
        let report = match self
            .validate_integrity(self.config.sample_size, &self.config.tiers)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!("Cache integrity check failed: {}", e);
                self.events
                    .emit(CacheEvent::error("validate_integrity", e.to_string()));
                return None;
            }
        };

        for tier in report.tiers.iter().filter(|t| t.status != HealthStatus::Healthy) {
            warn!(
                "Cache tier {} is {} ({:.1}% of {} sampled entries valid)",
                tier.tier,
                tier.status.as_str(),
                tier.valid_ratio * 100.0,
                tier.sampled
            );
            self.events.emit(CacheEvent::CacheHealthAlert {
                operation_id: report.id.clone(),
                tier: tier.tier.clone(),
                status: tier.status.as_str().to_string(),
                valid_ratio: tier.valid_ratio,
                sampled: tier.sampled,
            });
        }

        Some(report)
    }

    fn classify(&self, valid_ratio: f64) -> HealthStatus {
        if valid_ratio >= self.config.healthy_threshold {
            HealthStatus::Healthy
        } else if valid_ratio >= self.config.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    async fn backup(&self, namespace: &str, key: &str) -> bool {
        let bytes = match self.backend.get(namespace, key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(e) => {
                warn!("Failed to read {}/{} for backup: {}", namespace, key, e);
                return false;
            }
        };

        let backup_key = format!("{}:{}", namespace, key);
        match self
            .backend
            .set(
                &self.config.backup_namespace,
                &backup_key,
                &bytes,
                self.config.backup_ttl,
                &[],
            )
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to back up {}/{}: {}", namespace, key, e);
                false
            }
        }
    }

    async fn reload(&self, namespace: &str, key: &str, loader: &dyn SourceLoader) -> bool {
        let entry = match loader.load(namespace, key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                warn!("Source reload of {}/{} failed: {}", namespace, key, e);
                return false;
            }
        };

        let tags: Vec<String> = entry.tags.iter().cloned().collect();
        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode reloaded entry {}/{}: {}", namespace, key, e);
                return false;
            }
        };

        self.backend
            .set(namespace, key, &bytes, Duration::from_secs(entry.ttl), &tags)
            .await
            .unwrap_or(false)
    }

    fn check_entry(
        entry: &CacheEntry,
        remaining: Option<Duration>,
        rules: &[ValidationRule],
    ) -> Vec<RuleDiagnostic> {
        let data = entry.decoded_data().ok();
        let json: Option<Result<Value, String>> = data
            .as_ref()
            .map(|bytes| serde_json::from_slice(bytes).map_err(|e| e.to_string()));

        rules
            .iter()
            .map(|rule| {
                let outcome: Result<(), String> = match rule {
                    ValidationRule::JsonWellFormed => match &json {
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => Err(format!("invalid JSON: {}", e)),
                        None => Err("payload does not decompress".to_string()),
                    },
                    ValidationRule::ExpectedType(expected) => {
                        with_json(&json, |value| match JsonType::of(value) {
                            actual if actual == *expected => Ok(()),
                            actual => Err(format!("expected {:?}, found {:?}", expected, actual)),
                        })
                    }
                    ValidationRule::Schema { fields } => {
                        with_json(&json, |value| check_schema(value, fields))
                    }
                    ValidationRule::MaxSize(max) => match entry.original_size {
                        size if size <= *max => Ok(()),
                        size => Err(format!("{} bytes exceed the limit of {}", size, max)),
                    },
                    ValidationRule::TtlRemaining => {
                        let backend_alive = remaining.map_or(false, |left| !left.is_zero());
                        if backend_alive && entry.is_fresh() {
                            Ok(())
                        } else {
                            Err("entry has no time left to live".to_string())
                        }
                    }
                    ValidationRule::Checksum => match entry.verify_checksum() {
                        Ok(true) => Ok(()),
                        Ok(false) => Err("payload does not match its etag".to_string()),
                        Err(e) => Err(format!("payload does not decode: {}", e)),
                    },
                    ValidationRule::Business { name, predicate } => with_json(&json, |value| {
                        if predicate(value) {
                            Ok(())
                        } else {
                            Err(format!("business rule '{}' rejected the payload", name))
                        }
                    }),
                };

                RuleDiagnostic {
                    rule: rule.name(),
                    passed: outcome.is_ok(),
                    message: outcome.err(),
                }
            })
            .collect()
    }
}

fn with_json<F>(json: &Option<Result<Value, String>>, check: F) -> Result<(), String>
where
    F: FnOnce(&Value) -> Result<(), String>,
{
    match json {
        Some(Ok(value)) => check(value),
        Some(Err(e)) => Err(format!("invalid JSON: {}", e)),
        None => Err("payload does not decompress".to_string()),
    }
}

fn check_schema(value: &Value, fields: &BTreeMap<String, JsonType>) -> Result<(), String> {
    let objects: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    for (index, object) in objects.iter().enumerate() {
        let map = object
            .as_object()
            .ok_or_else(|| format!("item {} is not an object", index))?;
        for (field, expected) in fields {
            match map.get(field) {
                None => return Err(format!("item {} is missing field '{}'", index, field)),
                Some(actual) if JsonType::of(actual) != *expected => {
                    return Err(format!(
                        "field '{}' of item {} is {:?}, expected {:?}",
                        field,
                        index,
                        JsonType::of(actual),
                        expected
                    ))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
