//! Suppression of replication catalog data before records reach the store.
//!
//! | Table                | DDL      | DML               |
//! |----------------------|----------|-------------------|
//! | `consistency`        | suppress | allow             |
//! | `heartbeat`          | suppress | allow UPDATE only |
//! | `trep_commit_seqno`  | suppress | suppress          |
//! | `trep_shard`         | suppress | suppress          |
//! | `trep_shard_channel` | suppress | suppress          |
//!
//! Only tables under the configured catalog schema are affected; schema and
//! table names are compared case-insensitively.

use tracing::debug;

use crate::store::{DbmsData, LogRecord, RowAction, RowChange, SqlOperation, Statement};
use crate::{Error, Result};

const ALWAYS_SUPPRESSED: [&str; 3] = ["trep_commit_seqno", "trep_shard", "trep_shard_channel"];

#[derive(Debug, Clone)]
pub struct CatalogFilter {
    catalog_schema: String,
}

impl CatalogFilter {
    pub fn new(catalog_schema: &str) -> Result<Self> {
        if catalog_schema.is_empty() {
            return Err(Error::Config(
                "No catalog schema name specified in configuration; unable to filter catalog operations correctly"
                    .to_string(),
            ));
        }
        Ok(Self {
            catalog_schema: catalog_schema.to_lowercase(),
        })
    }

    pub fn catalog_schema(&self) -> &str {
        &self.catalog_schema
    }

    /// Removes catalog data from `record`. Returns `None` when nothing is
    /// left of an unfragmented record; fragments are always kept so the
    /// commit fragment is never lost.
    pub fn filter(&self, mut record: LogRecord) -> Option<LogRecord> {
        record.data.retain_mut(|data| match data {
            DbmsData::RowChanges { changes } => {
                changes.retain(|change| !self.suppresses_row_change(change));
                !changes.is_empty()
            }
            DbmsData::Statement(statement) => !self.suppresses_statement(statement, record.seqno),
        });

        if record.is_unfragmented() && record.data.is_empty() {
            debug!(seqno = record.seqno, "Dropping record holding only catalog data");
            return None;
        }
        Some(record)
    }

    fn is_catalog_schema(&self, schema: &str) -> bool {
        schema.to_lowercase() == self.catalog_schema
    }

    fn suppresses_row_change(&self, change: &RowChange) -> bool {
        if !self.is_catalog_schema(&change.schema) {
            return false;
        }
        let table = change.table.to_lowercase();
        if ALWAYS_SUPPRESSED.contains(&table.as_str()) {
            true
        } else if table == "heartbeat" {
            change.action != RowAction::Update
        } else {
            false
        }
    }

    fn suppresses_statement(&self, statement: &Statement, seqno: u64) -> bool {
        let metadata = statement.metadata.as_ref();
        let schema = metadata
            .and_then(|m| m.schema.as_deref())
            .or(statement.default_schema.as_deref());
        let table = metadata.and_then(|m| m.table.as_deref());

        let (Some(schema), Some(table), Some(metadata)) = (schema, table, metadata) else {
            debug!(seqno, "Ignoring statement without schema or table");
            return false;
        };

        if !self.is_catalog_schema(schema) {
            return false;
        }
        let table = table.to_lowercase();
        let operation = metadata.operation;
        if ALWAYS_SUPPRESSED.contains(&table.as_str()) {
            true
        } else if table == "consistency" {
            !operation.is_dml()
        } else if table == "heartbeat" {
            operation != SqlOperation::Update
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> CatalogFilter {
        CatalogFilter::new("tungsten_foo").unwrap()
    }

    fn row_record(seqno: u64, schema: &str, table: &str, action: RowAction) -> LogRecord {
        let change = RowChange::new(schema, table, action).with_row(&["id"], vec![json!(99)]);
        LogRecord::new(
            seqno,
            "db1",
            vec![DbmsData::RowChanges {
                changes: vec![change],
            }],
        )
    }

    fn stmt_record(
        seqno: u64,
        default_schema: Option<&str>,
        schema: Option<&str>,
        table: &str,
        operation: SqlOperation,
    ) -> LogRecord {
        let statement = Statement::new("-- parsed upstream", default_schema).with_metadata(
            schema,
            Some(table),
            operation,
        );
        LogRecord::new(seqno, "db1", vec![DbmsData::Statement(statement)])
    }

    #[test]
    fn test_empty_schema_rejected() {
        assert!(matches!(CatalogFilter::new(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_accepts_non_catalog_row_changes() {
        let f = filter();
        assert!(f.filter(row_record(0, "tungsten_bar", "trep_commit_seqno", RowAction::Insert)).is_some());
        assert!(f.filter(row_record(1, "tungsten_foo", "non_catalog_table", RowAction::Insert)).is_some());
        assert!(f.filter(row_record(2, "foo", "test2", RowAction::Insert)).is_some());
    }

    #[test]
    fn test_commit_seqno_always_suppressed_case_insensitive() {
        let f = filter();
        for action in [RowAction::Insert, RowAction::Update, RowAction::Delete] {
            assert!(f.filter(row_record(1, "tungsten_foo", "trep_commit_seqno", action)).is_none());
            assert!(f.filter(row_record(1, "TUNGSTEN_FOO", "TREP_Commit_Seqno", action)).is_none());
        }
        assert!(f.filter(row_record(3, "tungsten_foo", "trep_shard", RowAction::Insert)).is_none());
        assert!(f.filter(row_record(4, "tungsten_foo", "trep_shard_channel", RowAction::Insert)).is_none());
    }

    #[test]
    fn test_heartbeat_allows_update_only() {
        let f = filter();
        assert!(f.filter(row_record(1, "tungsten_foo", "heartbeat", RowAction::Update)).is_some());
        assert!(f.filter(row_record(1, "tungsten_foo", "heartbeat", RowAction::Insert)).is_none());
        assert!(f.filter(row_record(1, "Tungsten_Foo", "HEARTBEAT", RowAction::Delete)).is_none());
    }

    #[test]
    fn test_consistency_rows_allowed() {
        let f = filter();
        assert!(f.filter(row_record(0, "tungsten_foo", "consistency", RowAction::Insert)).is_some());
    }

    #[test]
    fn test_catalog_ddl_suppressed() {
        let f = filter();
        assert!(f
            .filter(stmt_record(0, None, Some("tungsten_foo"), "consistency", SqlOperation::Create))
            .is_none());
        assert!(f
            .filter(stmt_record(0, None, Some("tungsten_foo"), "heartbeat", SqlOperation::Create))
            .is_none());
        assert!(f
            .filter(stmt_record(2, Some("tungsten_foo"), None, "TREP_COMMIT_SEQNO", SqlOperation::Alter))
            .is_none());
        assert!(f
            .filter(stmt_record(1, Some("tungsten_foo"), Some("tungsten_foo"), "trep_SHARD_channel", SqlOperation::Drop))
            .is_none());
    }

    #[test]
    fn test_catalog_dml_statements() {
        let f = filter();
        assert!(f
            .filter(stmt_record(0, None, Some("tungsten_foo"), "consistency", SqlOperation::Insert))
            .is_some());
        assert!(f
            .filter(stmt_record(0, None, Some("tungsten_foo"), "heartbeat", SqlOperation::Update))
            .is_some());
        assert!(f
            .filter(stmt_record(0, Some("tungsten_foo"), None, "heartbeat", SqlOperation::Insert))
            .is_none());
        assert!(f
            .filter(stmt_record(0, None, Some("tungsten_foo"), "trep_shard_CHANNEL", SqlOperation::Delete))
            .is_none());
    }

    #[test]
    fn test_non_catalog_statements_accepted() {
        let f = filter();
        assert!(f
            .filter(stmt_record(0, None, Some("tungsten_bar"), "trep_commit_seqno", SqlOperation::Create))
            .is_some());
        assert!(f
            .filter(stmt_record(0, Some("my_default_schema"), None, "heartbeat", SqlOperation::Insert))
            .is_some());

        // No metadata and no default schema: nothing to match against.
        let unparsed = LogRecord::new(
            0,
            "db1",
            vec![DbmsData::Statement(Statement::new("insert into bar(val) values(1)", None))],
        );
        assert!(f.filter(unparsed).is_some());
    }

    #[test]
    fn test_partial_suppression_keeps_remaining_data() {
        let f = filter();
        let record = LogRecord::new(
            7,
            "db1",
            vec![DbmsData::RowChanges {
                changes: vec![
                    RowChange::new("tungsten_foo", "trep_commit_seqno", RowAction::Update),
                    RowChange::new("app", "orders", RowAction::Insert),
                ],
            }],
        );

        let filtered = f.filter(record).unwrap();
        let DbmsData::RowChanges { changes } = &filtered.data[0] else {
            panic!("expected row changes");
        };
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].table, "orders");
    }

    #[test]
    fn test_fragments_never_dropped() {
        let f = filter();
        let fragment = row_record(5, "tungsten_foo", "trep_commit_seqno", RowAction::Update)
            .with_fragment(1, true);
        let filtered = f.filter(fragment).unwrap();
        assert!(filtered.data.is_empty());
    }
}
