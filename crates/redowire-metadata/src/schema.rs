//! Schema snapshot: data-object id → `(owner, table, columns)`.
//!
//! The snapshot is immutable once published; the parser thread replaces
//! it atomically (an `Arc` swap) when DDL invalidates an object. It is
//! seeded from a JSON document listing the tracked tables, filtered by
//! the configured `filter.table` regex pairs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redowire_error::{RedowireError, Result};
use redowire_types::{ColumnType, Scn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One tracked column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ctype: ColumnType,
}

/// One tracked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub owner: String,
    #[serde(rename = "table")]
    pub name: String,
    /// Data object id the redo change vectors carry.
    pub obj: u32,
    pub columns: Vec<ColumnDef>,
}

/// The schema seed document (`database`, start `scn`, tracked tables).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSeed {
    pub database: String,
    pub scn: u64,
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

/// An `(owner, table)` regex pair from `filter.table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFilterRule {
    pub owner: String,
    pub table: String,
}

/// Compiled table filter. An empty filter admits everything.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    rules: Vec<(Regex, Regex)>,
}

impl TableFilter {
    pub fn compile(rules: &[TableFilterRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let owner = anchored(&rule.owner)?;
            let table = anchored(&rule.table)?;
            compiled.push((owner, table));
        }
        Ok(Self { rules: compiled })
    }

    /// Whether `(owner, table)` is tracked.
    #[must_use]
    pub fn matches(&self, owner: &str, table: &str) -> bool {
        self.rules.is_empty()
            || self
                .rules
                .iter()
                .any(|(o, t)| o.is_match(owner) && t.is_match(table))
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| RedowireError::BadConfig {
        detail: format!("bad table filter regex {pattern:?}: {e}"),
    })
}

/// Immutable schema snapshot published to the parser.
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    pub scn: Scn,
    pub schemaless: bool,
    tables_by_obj: HashMap<u32, TableDef>,
}

impl SchemaSnapshot {
    /// The empty snapshot admitted in schemaless mode.
    #[must_use]
    pub fn schemaless() -> Self {
        Self {
            scn: Scn::ZERO,
            schemaless: true,
            tables_by_obj: HashMap::new(),
        }
    }

    /// Build a snapshot from a seed, applying the table filter.
    #[must_use]
    pub fn from_seed(seed: SchemaSeed, filter: &TableFilter) -> Self {
        let mut tables_by_obj = HashMap::new();
        for table in seed.tables {
            if !filter.matches(&table.owner, &table.name) {
                continue;
            }
            tables_by_obj.insert(table.obj, table);
        }
        Self {
            scn: Scn::new(seed.scn),
            schemaless: false,
            tables_by_obj,
        }
    }

    /// Load and filter a seed document from disk.
    pub fn load(path: &Path, filter: &TableFilter) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let seed: SchemaSeed = serde_json::from_str(&text).map_err(|e| {
            RedowireError::BadConfig {
                detail: format!("bad schema seed '{}': {e}", path.display()),
            }
        })?;
        info!(path = %path.display(), tables = seed.tables.len(), scn = seed.scn, "schema seed loaded");
        Ok(Self::from_seed(seed, filter))
    }

    /// Resolve a data object id.
    #[must_use]
    pub fn table(&self, obj: u32) -> Option<&TableDef> {
        self.tables_by_obj.get(&obj)
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables_by_obj.len()
    }

    /// A copy of this snapshot without `(owner, name)` — the DDL
    /// invalidation path. Returns `None` when the object is untracked.
    #[must_use]
    pub fn without_object(self: &Arc<Self>, owner: &str, name: &str) -> Option<Arc<Self>> {
        let obj = self
            .tables_by_obj
            .values()
            .find(|t| t.owner == owner && t.name == name)
            .map(|t| t.obj)?;
        warn!(owner, table = name, obj, "DDL invalidated a tracked table");
        let mut tables_by_obj = self.tables_by_obj.clone();
        tables_by_obj.remove(&obj);
        Some(Arc::new(Self {
            scn: self.scn,
            schemaless: self.schemaless,
            tables_by_obj,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> SchemaSeed {
        serde_json::from_str(
            r#"{
                "database": "TEST",
                "scn": 1000,
                "tables": [
                    {
                        "owner": "OLTP", "table": "ORDERS", "obj": 70001,
                        "columns": [
                            {"name": "ID", "type": "number"},
                            {"name": "NAME", "type": "varchar2"},
                            {"name": "VAL", "type": "number"}
                        ]
                    },
                    {
                        "owner": "STAGE", "table": "SCRATCH", "obj": 70002,
                        "columns": [{"name": "X", "type": "number"}]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn seed_parses_and_resolves() {
        let snapshot = SchemaSnapshot::from_seed(seed(), &TableFilter::default());
        assert_eq!(snapshot.scn, Scn::new(1000));
        assert_eq!(snapshot.table_count(), 2);
        let table = snapshot.table(70001).unwrap();
        assert_eq!(table.owner, "OLTP");
        assert_eq!(table.columns[1].name, "NAME");
        assert_eq!(table.columns[1].ctype, ColumnType::Varchar2);
        assert!(snapshot.table(99999).is_none());
    }

    #[test]
    fn filter_restricts_tables() {
        let filter = TableFilter::compile(&[TableFilterRule {
            owner: "OLTP".to_owned(),
            table: ".*".to_owned(),
        }])
        .unwrap();
        let snapshot = SchemaSnapshot::from_seed(seed(), &filter);
        assert_eq!(snapshot.table_count(), 1);
        assert!(snapshot.table(70001).is_some());
        assert!(snapshot.table(70002).is_none());
    }

    #[test]
    fn filter_is_anchored() {
        let filter = TableFilter::compile(&[TableFilterRule {
            owner: "OLTP".to_owned(),
            table: "ORDER".to_owned(),
        }])
        .unwrap();
        // "ORDER" must not match "ORDERS".
        assert!(!filter.matches("OLTP", "ORDERS"));
        assert!(filter.matches("OLTP", "ORDER"));
    }

    #[test]
    fn bad_regex_is_config_error() {
        let bad = TableFilter::compile(&[TableFilterRule {
            owner: "(".to_owned(),
            table: ".*".to_owned(),
        }]);
        assert!(matches!(bad, Err(RedowireError::BadConfig { .. })));
    }

    #[test]
    fn ddl_invalidation_replaces_snapshot() {
        let snapshot = Arc::new(SchemaSnapshot::from_seed(seed(), &TableFilter::default()));
        let updated = snapshot.without_object("OLTP", "ORDERS").unwrap();
        assert!(updated.table(70001).is_none());
        assert!(updated.table(70002).is_some());
        // The original is untouched (immutable handoff).
        assert!(snapshot.table(70001).is_some());
        assert!(snapshot.without_object("NOPE", "NOPE").is_none());
    }

    #[test]
    fn schemaless_is_empty() {
        let snapshot = SchemaSnapshot::schemaless();
        assert!(snapshot.schemaless);
        assert_eq!(snapshot.table_count(), 0);
    }
}
