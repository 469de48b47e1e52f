//! # Query Analyzer
//!
//! Stateless inspection of SQL text: statement type, referenced tables, structural features,
//! a complexity score and rough cost estimates used to decide cacheability and TTL.
//!
//! The estimates are deliberately coarse. They are computed from the text alone, before the
//! query ever runs; callers with measured execution times should prefer those.

use super::dependency::{RegexTableExtractor, TableDependencyExtractor};
use super::key_generator::normalize_sql;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

/// Functions whose result changes between executions
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "now(",
    "rand(",
    "random(",
    "uuid(",
    "gen_random_uuid(",
    "current_timestamp",
    "current_date",
    "current_time",
    "sysdate",
    "getdate(",
];

const AGGREGATE_FUNCTIONS: &[&str] = &["count(", "sum(", "avg(", "min(", "max("];

/// Kind of SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Drop,
    Truncate,
    Create,
    Alter,
    Other,
}

impl StatementType {
    /// Whether the statement changes data or schema
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Select | Self::Other)
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "select" => Some(Self::Select),
            "insert" | "replace" | "merge" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "drop" => Some(Self::Drop),
            "truncate" => Some(Self::Truncate),
            "create" => Some(Self::Create),
            "alter" => Some(Self::Alter),
            _ => None,
        }
    }
}

/// Complexity bucket derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl QueryComplexity {
    fn from_score(score: u32) -> Self {
        match score {
            0..=1 => Self::Simple,
            2..=4 => Self::Moderate,
            5..=9 => Self::Complex,
            _ => Self::VeryComplex,
        }
    }

    /// TTL multiplier: complex queries are assumed to be more expensive and more stable
    pub fn ttl_multiplier(&self) -> f64 {
        match self {
            Self::Simple => 1.0,
            Self::Moderate => 1.5,
            Self::Complex => 2.0,
            Self::VeryComplex => 3.0,
        }
    }
}

/// Result of analyzing a statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub statement_type: StatementType,
    pub is_mutating: bool,
    pub tables: BTreeSet<String>,
    pub join_count: usize,
    pub has_where: bool,
    pub has_subquery: bool,
    pub has_group_by: bool,
    pub has_order_by: bool,
    pub has_union: bool,
    pub has_distinct: bool,
    pub has_aggregate: bool,
    pub has_having: bool,
    pub has_like: bool,
    pub limit: Option<u64>,
    /// Uses functions such as `NOW()` or `RAND()`
    pub non_deterministic: bool,
    pub param_count: usize,
    pub complexity_score: u32,
    pub complexity: QueryComplexity,
    pub estimated_time_ms: u64,
    pub estimated_rows: u64,
}

/// Thresholds deciding whether a read is worth caching
#[derive(Debug, Clone, Copy)]
pub struct CacheabilityLimits {
    /// Queries estimated faster than this are not worth caching
    pub min_execution_time_ms: u64,

    /// Queries with more bound parameters are not cached
    pub max_params: usize,

    /// Queries estimated to return more rows are not cached
    pub max_estimated_rows: u64,
}

impl Default for CacheabilityLimits {
    fn default() -> Self {
        Self {
            min_execution_time_ms: 10,
            max_params: 100,
            max_estimated_rows: 10_000,
        }
    }
}

/// SQL analyzer
#[derive(Clone)]
pub struct QueryAnalyzer {
    extractor: Arc<dyn TableDependencyExtractor>,
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self::new(Arc::new(RegexTableExtractor))
    }
}

impl std::fmt::Debug for QueryAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryAnalyzer").finish_non_exhaustive()
    }
}

fn join_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\bjoin\b").expect("join pattern is a valid regex"))
}

fn limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\blimit\s+(\d+)").expect("limit pattern is a valid regex"))
}

fn id_lookup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\bwhere\s+(?:\w+\.)?id\s*=").expect("id lookup pattern is a valid regex")
    })
}

fn has_word(sql: &str, word: &str) -> bool {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|token| token == word)
}

impl QueryAnalyzer {
    /// Create an analyzer with a custom table extractor
    pub fn new(extractor: Arc<dyn TableDependencyExtractor>) -> Self {
        Self { extractor }
    }

    /// Tables referenced by the statement
    pub fn extract_tables(&self, sql: &str) -> BTreeSet<String> {
        self.extractor.extract_tables(sql)
    }

    /// Analyze a statement with no bound parameters
    pub fn analyze(&self, sql: &str) -> QueryAnalysis {
        self.analyze_with_params(sql, 0)
    }

    /// Analyze a statement with the given number of bound parameters
    pub fn analyze_with_params(&self, sql: &str, param_count: usize) -> QueryAnalysis {
        let normalized = normalize_sql(sql);
        let statement_type = Self::statement_type(&normalized);

        let join_count = join_pattern().find_iter(&normalized).count();
        let has_where = has_word(&normalized, "where");
        let has_subquery = normalized.matches("select").count() > 1;
        let has_group_by = normalized.contains("group by");
        let has_order_by = normalized.contains("order by");
        let has_union = has_word(&normalized, "union");
        let has_distinct = has_word(&normalized, "distinct");
        let has_having = has_word(&normalized, "having");
        let has_like = has_word(&normalized, "like") || has_word(&normalized, "ilike");
        let has_aggregate = AGGREGATE_FUNCTIONS
            .iter()
            .any(|f| normalized.contains(f));
        let non_deterministic = NON_DETERMINISTIC_FUNCTIONS
            .iter()
            .any(|f| normalized.contains(f));
        let limit = limit_pattern()
            .captures(&normalized)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let complexity_score = join_count as u32 * 2
            + if has_subquery { 3 } else { 0 }
            + if has_group_by { 2 } else { 0 }
            + if has_order_by { 1 } else { 0 }
            + if has_union { 3 } else { 0 }
            + if has_distinct { 1 } else { 0 }
            + if has_aggregate { 1 } else { 0 }
            + if has_having { 1 } else { 0 }
            + if has_like { 1 } else { 0 };

        // full scans cost more than the score suggests
        let full_scan_penalty = if statement_type == StatementType::Select && !has_where {
            8
        } else {
            0
        };
        let estimated_time_ms = 2 + complexity_score as u64 * 4 + full_scan_penalty;

        let estimated_rows = if let Some(limit) = limit {
            limit
        } else if has_aggregate && !has_group_by {
            1
        } else if id_lookup_pattern().is_match(&normalized) {
            1
        } else if has_where {
            1_000
        } else {
            50_000
        };

        QueryAnalysis {
            statement_type,
            is_mutating: statement_type.is_mutating(),
            tables: self.extractor.extract_tables(sql),
            join_count,
            has_where,
            has_subquery,
            has_group_by,
            has_order_by,
            has_union,
            has_distinct,
            has_aggregate,
            has_having,
            has_like,
            limit,
            non_deterministic,
            param_count,
            complexity_score,
            complexity: QueryComplexity::from_score(complexity_score),
            estimated_time_ms,
            estimated_rows,
        }
    }

    /// Reason a statement should not be cached, `None` if it may be
    pub fn non_cacheable_reason(
        &self,
        analysis: &QueryAnalysis,
        limits: &CacheabilityLimits,
    ) -> Option<String> {
        if analysis.is_mutating {
            return Some(format!("{:?} statements are not cached", analysis.statement_type));
        }
        if analysis.statement_type != StatementType::Select {
            return Some("only SELECT statements are cached".to_string());
        }
        if analysis.non_deterministic {
            return Some("query uses non-deterministic functions".to_string());
        }
        if analysis.estimated_time_ms < limits.min_execution_time_ms {
            return Some(format!(
                "estimated execution time {}ms is below {}ms",
                analysis.estimated_time_ms, limits.min_execution_time_ms
            ));
        }
        if analysis.param_count > limits.max_params {
            return Some(format!(
                "{} parameters exceed the limit of {}",
                analysis.param_count, limits.max_params
            ));
        }
        if analysis.estimated_rows > limits.max_estimated_rows {
            return Some(format!(
                "estimated {} rows exceed the limit of {}",
                analysis.estimated_rows, limits.max_estimated_rows
            ));
        }
        None
    }

    /// Whether a statement may be cached
    pub fn is_cacheable(&self, analysis: &QueryAnalysis, limits: &CacheabilityLimits) -> bool {
        self.non_cacheable_reason(analysis, limits).is_none()
    }

    fn statement_type(normalized: &str) -> StatementType {
        let first = normalized
            .split(|c: char| c.is_whitespace() || c == '(')
            .find(|w| !w.is_empty());

        match first {
            // a CTE takes the type of the statement that follows its definitions
            Some("with") => Self::top_level_words(normalized)
                .into_iter()
                .find_map(|w| StatementType::from_keyword(&w))
                .unwrap_or(StatementType::Other),
            Some(first) => StatementType::from_keyword(first).unwrap_or(StatementType::Other),
            None => StatementType::Other,
        }
    }

    /// Words outside any parentheses
    fn top_level_words(normalized: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut depth = 0usize;

        for ch in normalized.chars() {
            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                c if depth == 0 && (c.is_alphanumeric() || c == '_') => {
                    current.push(c);
                    continue;
                }
                _ => {}
            }
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            words.push(current);
        }
        words
    }
}
