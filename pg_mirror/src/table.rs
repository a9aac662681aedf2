use std::fmt;

use postgres_protocol::escape::escape_identifier;

/// Relation oid of a table, as reported by `tg_relid`.
pub type TableId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        TableName {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Schema-qualified name with both parts quoted, safe to splice into DDL.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = escape_identifier(&self.schema);
        let quoted_name = escape_identifier(&self.name);
        format!("{quoted_schema}.{quoted_name}")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_both_parts() {
        let table = TableName::new("public", "zerver_message");
        assert_eq!(table.as_quoted_identifier(), r#""public"."zerver_message""#);
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        let table = TableName::new("odd\"schema", "t");
        assert_eq!(table.as_quoted_identifier(), r#""odd""schema"."t""#);
    }

    #[test]
    fn display_is_unquoted() {
        assert_eq!(TableName::new("public", "users").to_string(), "public.users");
    }
}
