use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

/// Operation recognised on a statement by the upstream SQL matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlOperation {
    Insert,
    Update,
    Delete,
    Replace,
    Create,
    Alter,
    Drop,
    Truncate,
    Other,
}

impl SqlOperation {
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            SqlOperation::Insert | SqlOperation::Update | SqlOperation::Delete | SqlOperation::Replace
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub action: RowAction,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub keys: Vec<Vec<serde_json::Value>>,
}

/// Parsing metadata attached to a statement before it reaches the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementMetadata {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub operation: SqlOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub query: String,
    pub default_schema: Option<String>,
    pub metadata: Option<StatementMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DbmsData {
    RowChanges { changes: Vec<RowChange> },
    Statement(Statement),
}

/// One entry of the Transaction History Log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seqno: u64,
    #[serde(default)]
    pub fragno: u16,
    #[serde(default = "default_last_frag")]
    pub last_frag: bool,
    #[serde(default)]
    pub epoch: u64,
    pub source_id: String,
    pub extracted_at: DateTime<Utc>,
    pub data: Vec<DbmsData>,
}

fn default_last_frag() -> bool {
    true
}

impl LogRecord {
    pub fn new(seqno: u64, source_id: impl Into<String>, data: Vec<DbmsData>) -> Self {
        Self {
            seqno,
            fragno: 0,
            last_frag: true,
            epoch: 0,
            source_id: source_id.into(),
            extracted_at: Utc::now(),
            data,
        }
    }

    pub fn with_fragment(mut self, fragno: u16, last_frag: bool) -> Self {
        self.fragno = fragno;
        self.last_frag = last_frag;
        self
    }

    /// A record that is not split across fragments.
    pub fn is_unfragmented(&self) -> bool {
        self.fragno == 0 && self.last_frag
    }
}

impl RowChange {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, action: RowAction) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            action,
            columns: Vec::new(),
            values: Vec::new(),
            keys: Vec::new(),
        }
    }

    pub fn with_row(mut self, columns: &[&str], values: Vec<serde_json::Value>) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self.values.push(values);
        self
    }
}

impl Statement {
    pub fn new(query: impl Into<String>, default_schema: Option<&str>) -> Self {
        Self {
            query: query.into(),
            default_schema: default_schema.map(str::to_string),
            metadata: None,
        }
    }

    pub fn with_metadata(
        mut self,
        schema: Option<&str>,
        table: Option<&str>,
        operation: SqlOperation,
    ) -> Self {
        self.metadata = Some(StatementMetadata {
            schema: schema.map(str::to_string),
            table: table.map(str::to_string),
            operation,
        });
        self
    }
}
