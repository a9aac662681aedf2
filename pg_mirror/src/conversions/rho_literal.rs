use std::fmt::Write;

use serde_json::{Number, Value};
use thiserror::Error;

use super::change_record::RowSnapshot;

/// Rholang's unit value, used wherever a snapshot or column is absent.
pub const NIL: &str = "Nil";

pub struct RhoLiteral;

#[derive(Debug, Error)]
pub enum RhoLiteralError {
    #[error("number {0} cannot be represented as a rholang Int")]
    UnsupportedNumber(Number),

    #[error("unable to escape string value")]
    InvalidString(#[from] serde_json::Error),
}

impl RhoLiteral {
    /// Encodes an optional row snapshot. An absent snapshot becomes [`NIL`],
    /// which can never collide with a string column holding the text "null"
    /// because strings are always emitted quoted.
    pub fn from_snapshot(snapshot: Option<&RowSnapshot>) -> Result<String, RhoLiteralError> {
        match snapshot {
            None => Ok(NIL.to_string()),
            Some(row) => {
                let mut out = String::new();
                Self::write_map(&mut out, row)?;
                Ok(out)
            }
        }
    }

    pub fn from_str_value(val: &str) -> Result<String, RhoLiteralError> {
        Ok(serde_json::to_string(val)?)
    }

    pub fn from_value(val: &Value) -> Result<String, RhoLiteralError> {
        let mut out = String::new();
        Self::write_value(&mut out, val)?;
        Ok(out)
    }

    fn write_value(out: &mut String, val: &Value) -> Result<(), RhoLiteralError> {
        match val {
            Value::Null => out.push_str(NIL),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => match n.as_i64() {
                Some(i) => {
                    let _ = write!(out, "{i}");
                }
                None => return Err(RhoLiteralError::UnsupportedNumber(n.clone())),
            },
            Value::String(s) => out.push_str(&Self::from_str_value(s)?),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    Self::write_value(out, item)?;
                }
                out.push(']');
            }
            Value::Object(map) => Self::write_map(out, map)?,
        }
        Ok(())
    }

    fn write_map(out: &mut String, map: &RowSnapshot) -> Result<(), RhoLiteralError> {
        out.push('{');
        for (i, (key, val)) in map.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&Self::from_str_value(key)?);
            out.push_str(": ");
            Self::write_value(out, val)?;
        }
        out.push('}');
        Ok(())
    }
}
