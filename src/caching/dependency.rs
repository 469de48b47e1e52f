//! # Dependency Tracking
//!
//! Table dependency extraction and the dependency graph used by invalidation.
//!
//! ## Table extraction
//! [`RegexTableExtractor`] is a heuristic, not a SQL parser. It picks up the identifier that
//! follows `FROM`, `JOIN`, `UPDATE`, `INTO` (covering `DELETE FROM` and `INSERT INTO`),
//! strips quoting and schema qualification and lower-cases it. Known blind spots:
//! - only the first table of a comma-separated `FROM a, b` list is found
//! - CTE names are reported as tables and the tables inside the CTE body are found only when
//!   they follow one of the keywords above
//! - table-valued functions and derived tables in `FROM (...)` are skipped
//! - `ON DUPLICATE KEY UPDATE col` and similar clauses can yield false positives
//!
//! Swap in a real parser by implementing [`TableDependencyExtractor`].
//!
//! ## Graph
//! [`DependencyGraph`] maps tables to the cache keys that read them, cache keys to the keys
//! derived from them, and tables to the tables derived from them. Edges are removed together
//! with the cache key they describe.

use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

/// Extracts the tables a statement reads or writes
pub trait TableDependencyExtractor: Send + Sync {
    /// Table names referenced by the statement, normalized and de-duplicated
    fn extract_tables(&self, sql: &str) -> BTreeSet<String>;
}

const NOT_TABLES: &[&str] = &["select", "lateral", "unnest", "only", "set", "values"];

fn table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:from|join|update|into)\s+([A-Za-z_"`\[][\w."`\[\]$]*)"#)
            .expect("table pattern is a valid regex")
    })
}

/// Keyword-driven regex table extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexTableExtractor;

impl RegexTableExtractor {
    /// Strip quoting and schema qualification
    pub fn normalize_table(raw: &str) -> String {
        let unquoted: String = raw
            .chars()
            .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
            .collect();
        unquoted
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}

impl TableDependencyExtractor for RegexTableExtractor {
    fn extract_tables(&self, sql: &str) -> BTreeSet<String> {
        table_pattern()
            .captures_iter(sql)
            .filter_map(|caps| caps.get(1))
            .map(|m| Self::normalize_table(m.as_str()))
            .filter(|table| !table.is_empty() && !NOT_TABLES.contains(&table.as_str()))
            .collect()
    }
}

/// Graph of table and cache-key dependencies
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Table → cache keys reading it
    table_to_keys: HashMap<String, HashSet<String>>,

    /// Cache key → tables it reads
    key_to_tables: HashMap<String, HashSet<String>>,

    /// Cache key → searchable label (normalized SQL and parameters)
    key_labels: HashMap<String, String>,

    /// Cache key → keys derived from it
    key_dependents: HashMap<String, HashSet<String>>,

    /// Table → tables derived from it (views, rollups)
    table_dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a cache key reads the given tables
    pub fn register_query<I>(&mut self, key: &str, tables: I, label: impl Into<String>)
    where
        I: IntoIterator<Item = String>,
    {
        let entry = self.key_to_tables.entry(key.to_string()).or_default();
        for table in tables {
            self.table_to_keys
                .entry(table.clone())
                .or_default()
                .insert(key.to_string());
            entry.insert(table);
        }
        self.key_labels.insert(key.to_string(), label.into());
    }

    /// Record that `dependent` is derived from `parent`
    pub fn register_key_dependency(&mut self, parent: &str, dependent: &str) {
        if parent == dependent {
            return;
        }
        self.key_dependents
            .entry(parent.to_string())
            .or_default()
            .insert(dependent.to_string());
    }

    /// Record that `derived` is computed from `source`
    pub fn register_table_dependency(&mut self, source: &str, derived: &str) {
        if source == derived {
            return;
        }
        self.table_dependents
            .entry(source.to_string())
            .or_default()
            .insert(derived.to_string());
    }

    /// Cache keys reading a table
    pub fn keys_for_table(&self, table: &str) -> Vec<String> {
        self.table_to_keys
            .get(table)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tables read by a cache key
    pub fn tables_for_key(&self, key: &str) -> Vec<String> {
        self.key_to_tables
            .get(key)
            .map(|tables| tables.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys derived from a key
    pub fn dependent_keys(&self, key: &str) -> Vec<String> {
        self.key_dependents
            .get(key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tables derived from a table
    pub fn dependent_tables(&self, table: &str) -> Vec<String> {
        self.table_dependents
            .get(table)
            .map(|tables| tables.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Searchable label of a key
    pub fn label(&self, key: &str) -> Option<&str> {
        self.key_labels.get(key).map(String::as_str)
    }

    /// All tracked keys with their labels
    pub fn labels(&self) -> impl Iterator<Item = (&String, &String)> {
        self.key_labels.iter()
    }

    /// Whether a key is tracked
    pub fn contains_key(&self, key: &str) -> bool {
        self.key_to_tables.contains_key(key)
    }

    /// Number of tracked keys
    pub fn key_count(&self) -> usize {
        self.key_to_tables.len()
    }

    /// Number of tables with at least one dependent key
    pub fn table_count(&self) -> usize {
        self.table_to_keys.len()
    }

    /// Remove a key and every edge it participates in. Empty tables are pruned.
    pub fn remove_key(&mut self, key: &str) -> bool {
        let tables = self.key_to_tables.remove(key);
        let label = self.key_labels.remove(key);
        let dependents = self.key_dependents.remove(key);

        for table in tables.iter().flatten() {
            let now_empty = match self.table_to_keys.get_mut(table) {
                Some(keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.table_to_keys.remove(table);
            }
        }

        self.key_dependents.retain(|_, children| {
            children.remove(key);
            !children.is_empty()
        });

        tables.is_some() || label.is_some() || dependents.is_some()
    }

    /// Drop a table's key set, returning the keys that were recorded against it
    pub fn remove_table(&mut self, table: &str) -> Vec<String> {
        self.table_to_keys
            .remove(table)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(sql: &str) -> Vec<String> {
        RegexTableExtractor.extract_tables(sql).into_iter().collect()
    }

    #[test]
    fn test_extracts_tables_from_common_statements() {
        assert_eq!(tables("SELECT * FROM orders WHERE id=5"), vec!["orders"]);
        assert_eq!(
            tables("select o.id from Orders o join customers c on c.id = o.customer_id"),
            vec!["customers", "orders"]
        );
        assert_eq!(tables("UPDATE users SET name = 'x'"), vec!["users"]);
        assert_eq!(tables("DELETE FROM sessions WHERE expired"), vec!["sessions"]);
        assert_eq!(tables("INSERT INTO audit_log VALUES (1)"), vec!["audit_log"]);
    }

    #[test]
    fn test_normalizes_quoting_and_schema() {
        assert_eq!(tables(r#"SELECT * FROM "public"."Orders""#), vec!["orders"]);
        assert_eq!(tables("SELECT * FROM `shop`.`items`"), vec!["items"]);
        assert_eq!(tables("SELECT * FROM [dbo].[Invoices]"), vec!["invoices"]);
    }

    #[test]
    fn test_skips_derived_tables() {
        assert_eq!(
            tables("SELECT * FROM (SELECT id FROM orders) AS recent"),
            vec!["orders"]
        );
    }

    #[test]
    fn test_graph_registration_and_removal() {
        let mut graph = DependencyGraph::new();
        graph.register_query("k1", vec!["orders".to_string()], "select * from orders");
        graph.register_query(
            "k2",
            vec!["orders".to_string(), "customers".to_string()],
            "select * from orders join customers",
        );
        graph.register_key_dependency("k1", "k2");

        assert_eq!(graph.keys_for_table("orders").len(), 2);
        assert_eq!(graph.dependent_keys("k1"), vec!["k2".to_string()]);

        assert!(graph.remove_key("k2"));
        assert!(graph.dependent_keys("k1").is_empty());
        assert!(graph.keys_for_table("customers").is_empty());
        assert_eq!(graph.table_count(), 1);

        // removing again is a no-op
        assert!(!graph.remove_key("k2"));
    }

    #[test]
    fn test_self_edges_are_ignored() {
        let mut graph = DependencyGraph::new();
        graph.register_key_dependency("k1", "k1");
        graph.register_table_dependency("orders", "orders");
        assert!(graph.dependent_keys("k1").is_empty());
        assert!(graph.dependent_tables("orders").is_empty());
    }
}
