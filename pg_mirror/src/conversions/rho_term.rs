use std::fmt;

use thiserror::Error;

use super::{
    change_record::ChangeRecord,
    rho_literal::{RhoLiteral, RhoLiteralError, NIL},
};

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("unable to encode row: {0}")]
    Literal(#[from] RhoLiteralError),

    #[error("contract uri {0} cannot be embedded in a uri literal")]
    InvalidContractUri(String),
}

/// Sink-specific encoding of a single change record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn new(body: impl Into<String>) -> Payload {
        Payload(body.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait EventSerializer: Send + Sync {
    fn serialize(&self, record: &ChangeRecord) -> Result<Payload, SerializationError>;
}

/// Turns each change record into a deploy term that sends the change to the
/// mirror contract registered under `contract_uri`:
///
/// `db!(op, table_name, OLD, NEW, Nil)`
///
/// The call always has five arguments; missing snapshots are passed as `Nil`.
#[derive(Debug, Clone)]
pub struct RhoTermSerializer {
    contract_uri: String,
}

impl RhoTermSerializer {
    pub fn new(contract_uri: impl Into<String>) -> Result<RhoTermSerializer, SerializationError> {
        let contract_uri = contract_uri.into();
        if contract_uri.is_empty() || contract_uri.contains('`') {
            return Err(SerializationError::InvalidContractUri(contract_uri));
        }
        Ok(RhoTermSerializer { contract_uri })
    }
}

impl EventSerializer for RhoTermSerializer {
    fn serialize(&self, record: &ChangeRecord) -> Result<Payload, SerializationError> {
        let op = RhoLiteral::from_str_value(record.operation().as_str())?;
        let table_name = RhoLiteral::from_str_value(&record.table().name)?;
        let old = RhoLiteral::from_snapshot(record.before())?;
        let new = RhoLiteral::from_snapshot(record.after())?;
        let uri = &self.contract_uri;

        // Nil return channel: the deploy does not wait for the contract.
        Ok(Payload::new(format!(
            "new deployerId(`rho:rchain:deployerId`) in {{\n  \
               for(db <<- @{{[*deployerId, `{uri}`]}}) {{\n    \
                 db!({op}, {table_name}, {old}, {new}, {NIL})\n  \
               }}\n\
             }}\n"
        )))
    }
}
