use std::{fmt, str::FromStr};

use serde::Deserialize;
use thiserror::Error;

use crate::table::{TableId, TableName};

#[derive(Debug, Error)]
pub enum ChangeRecordConversionError {
    #[error("notification is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("notification field `{0}` is missing")]
    MissingField(&'static str),

    #[error("unknown operation {0}")]
    UnknownOperation(String),

    #[error("{0} notification without an OLD row")]
    MissingOldRow(Operation),

    #[error("{0} notification without a NEW row")]
    MissingNewRow(Operation),

    #[error("{0} notification carries an unexpected {1} row")]
    UnexpectedRow(Operation, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    fn has_old_row(&self) -> bool {
        matches!(self, Operation::Update | Operation::Delete)
    }

    fn has_new_row(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ChangeRecordConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(ChangeRecordConversionError::UnknownOperation(
                other.to_string(),
            )),
        }
    }
}

/// Column name to value, in the column order of the table.
pub type RowSnapshot = serde_json::Map<String, serde_json::Value>;

/// Wire shape of one trigger notification.
#[derive(Debug, Deserialize)]
struct Notice {
    schema: Option<String>,
    table_name: Option<String>,
    relid: Option<TableId>,
    op: Option<String>,
    #[serde(rename = "OLD")]
    old: Option<RowSnapshot>,
    #[serde(rename = "NEW")]
    new: Option<RowSnapshot>,
}

/// One row mutation captured from the database.
///
/// `before` is present exactly for UPDATE and DELETE, `after` exactly for
/// INSERT and UPDATE. The constructor rejects every other combination.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    operation: Operation,
    table: TableName,
    relation_id: TableId,
    before: Option<RowSnapshot>,
    after: Option<RowSnapshot>,
}

impl ChangeRecord {
    pub fn new(
        operation: Operation,
        table: TableName,
        relation_id: TableId,
        before: Option<RowSnapshot>,
        after: Option<RowSnapshot>,
    ) -> Result<ChangeRecord, ChangeRecordConversionError> {
        match (operation.has_old_row(), before.is_some()) {
            (true, false) => return Err(ChangeRecordConversionError::MissingOldRow(operation)),
            (false, true) => {
                return Err(ChangeRecordConversionError::UnexpectedRow(operation, "OLD"))
            }
            _ => {}
        }
        match (operation.has_new_row(), after.is_some()) {
            (true, false) => return Err(ChangeRecordConversionError::MissingNewRow(operation)),
            (false, true) => {
                return Err(ChangeRecordConversionError::UnexpectedRow(operation, "NEW"))
            }
            _ => {}
        }

        Ok(ChangeRecord {
            operation,
            table,
            relation_id,
            before,
            after,
        })
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn relation_id(&self) -> TableId {
        self.relation_id
    }

    pub fn before(&self) -> Option<&RowSnapshot> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&RowSnapshot> {
        self.after.as_ref()
    }
}

impl Notice {
    fn into_change_record(self) -> Result<ChangeRecord, ChangeRecordConversionError> {
        let op = self
            .op
            .ok_or(ChangeRecordConversionError::MissingField("op"))?;
        let schema = self
            .schema
            .ok_or(ChangeRecordConversionError::MissingField("schema"))?;
        let table_name = self
            .table_name
            .ok_or(ChangeRecordConversionError::MissingField("table_name"))?;
        let relid = self
            .relid
            .ok_or(ChangeRecordConversionError::MissingField("relid"))?;

        ChangeRecord::new(
            op.parse()?,
            TableName::new(schema, table_name),
            relid,
            self.old,
            self.new,
        )
    }
}

impl FromStr for ChangeRecord {
    type Err = ChangeRecordConversionError;

    fn from_str(payload: &str) -> Result<ChangeRecord, ChangeRecordConversionError> {
        let notice: Notice = serde_json::from_str(payload)?;
        notice.into_change_record()
    }
}
