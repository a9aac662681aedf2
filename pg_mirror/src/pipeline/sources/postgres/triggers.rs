use postgres_protocol::escape::{escape_identifier, escape_literal};
use thiserror::Error;
use tracing::info;

use crate::{
    clients::postgres::{NotifyClient, NotifyClientError},
    table::TableName,
};

#[derive(Debug, Error)]
pub enum TriggerInstallError {
    #[error("notify client error: {0}")]
    NotifyClient(#[from] NotifyClientError),

    #[error("no tables left to capture after exclusions")]
    NoTables,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Notification channel shared by all triggers.
    pub channel: String,
    /// Name of the shared trigger procedure.
    pub procedure: String,
    /// Tables never to instrument, either bare (`django_session`) or
    /// schema qualified (`public.django_session`).
    pub excluded_tables: Vec<String>,
    /// When set, only these tables are instrumented.
    pub watched_tables: Option<Vec<TableName>>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel: "mirror".to_string(),
            procedure: "notify_mirror".to_string(),
            excluded_tables: vec![],
            watched_tables: None,
        }
    }
}

impl CaptureConfig {
    fn is_excluded(&self, table: &TableName) -> bool {
        let qualified = table.to_string();
        self.excluded_tables
            .iter()
            .any(|excluded| *excluded == table.name || *excluded == qualified)
    }

    fn is_watched(&self, table: &TableName) -> bool {
        match self.watched_tables {
            Some(ref watched) => watched.contains(table),
            None => true,
        }
    }

    pub fn select_tables(&self, tables: Vec<TableName>) -> Vec<TableName> {
        tables
            .into_iter()
            .filter(|t| self.is_watched(t) && !self.is_excluded(t))
            .collect()
    }
}

/// A row trigger on one table that calls the shared notify procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBinding {
    pub table: TableName,
    pub procedure_name: String,
    pub channel_name: String,
}

impl TriggerBinding {
    pub fn new(table: TableName, config: &CaptureConfig) -> TriggerBinding {
        TriggerBinding {
            table,
            procedure_name: config.procedure.clone(),
            channel_name: config.channel.clone(),
        }
    }

    pub fn trigger_name(&self) -> String {
        format!("notify_{}__{}", self.table.schema, self.table.name)
    }

    pub fn drop_statement(&self) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            escape_identifier(&self.trigger_name()),
            self.table.as_quoted_identifier()
        )
    }

    pub fn create_statement(&self) -> String {
        format!(
            "CREATE TRIGGER {}
         AFTER INSERT OR UPDATE OR DELETE
            ON {}
      FOR EACH ROW
       EXECUTE PROCEDURE {}()",
            escape_identifier(&self.trigger_name()),
            self.table.as_quoted_identifier(),
            escape_identifier(&self.procedure_name)
        )
    }
}

/// Procedure that publishes every row change on `channel` as
/// `{ "schema", "table_name", "relid", "op", "OLD"?, "NEW"? }`.
///
/// The json is assembled by concatenation so row snapshots keep the column
/// order of the table.
pub fn notify_function_statement(procedure: &str, channel: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {proc}()
 RETURNS trigger
 LANGUAGE plpgsql
AS $$
BEGIN
  PERFORM pg_notify({channel},
                    '{{ "schema": ' || to_json(TG_TABLE_SCHEMA)::text ||
                    ', "table_name": ' || to_json(TG_TABLE_NAME)::text ||
                    ', "relid": ' || to_json(TG_RELID::bigint)::text ||
                    ', "op": ' || to_json(TG_OP)::text ||
                    CASE WHEN TG_OP IN ('UPDATE', 'DELETE') THEN ', "OLD": ' || row_to_json(OLD)::text ELSE '' END ||
                    CASE WHEN TG_OP IN ('INSERT', 'UPDATE') THEN ', "NEW": ' || row_to_json(NEW)::text ELSE '' END ||
                    '}}');
  RETURN NULL;
END;
$$"#,
        proc = escape_identifier(procedure),
        channel = escape_literal(channel),
    )
}

pub fn drop_function_statement(procedure: &str) -> String {
    format!("DROP FUNCTION IF EXISTS {}()", escape_identifier(procedure))
}

async fn capture_bindings(
    client: &NotifyClient,
    config: &CaptureConfig,
) -> Result<Vec<TriggerBinding>, TriggerInstallError> {
    let tables = config.select_tables(client.get_table_names().await?);
    Ok(tables
        .into_iter()
        .map(|table| TriggerBinding::new(table, config))
        .collect())
}

/// Creates the notify procedure and (re)creates one trigger per captured
/// table. Re-running replaces the existing triggers instead of adding more.
pub async fn install(
    client: &mut NotifyClient,
    config: &CaptureConfig,
) -> Result<Vec<TriggerBinding>, TriggerInstallError> {
    let bindings = capture_bindings(client, config).await?;
    if bindings.is_empty() {
        return Err(TriggerInstallError::NoTables);
    }

    info!("creating function {}", config.procedure);
    let mut statements = vec![notify_function_statement(
        &config.procedure,
        &config.channel,
    )];
    for binding in &bindings {
        info!("adding trigger on {}", binding.table);
        statements.push(binding.drop_statement());
        statements.push(binding.create_statement());
    }

    client.execute_in_transaction(&statements).await?;
    info!("installed {} triggers", bindings.len());

    Ok(bindings)
}

/// Drops the triggers of all captured tables and the notify procedure.
pub async fn uninstall(
    client: &mut NotifyClient,
    config: &CaptureConfig,
) -> Result<Vec<TriggerBinding>, TriggerInstallError> {
    let bindings = capture_bindings(client, config).await?;

    let mut statements: Vec<String> = bindings
        .iter()
        .inspect(|binding| info!("dropping trigger on {}", binding.table))
        .map(|binding| binding.drop_statement())
        .collect();
    statements.push(drop_function_statement(&config.procedure));

    client.execute_in_transaction(&statements).await?;
    info!("removed {} triggers", bindings.len());

    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Vec<TableName> {
        vec![
            TableName::new("public", "django_session"),
            TableName::new("public", "zerver_message"),
            TableName::new("public", "zerver_userpresence"),
            TableName::new("audit", "zerver_message"),
        ]
    }

    #[test]
    fn excludes_bare_and_qualified_names() {
        let config = CaptureConfig {
            excluded_tables: vec!["django_session".into(), "public.zerver_userpresence".into()],
            ..Default::default()
        };

        assert_eq!(
            config.select_tables(tables()),
            vec![
                TableName::new("public", "zerver_message"),
                TableName::new("audit", "zerver_message"),
            ]
        );
    }

    #[test]
    fn watched_tables_narrow_selection() {
        let config = CaptureConfig {
            excluded_tables: vec!["django_session".into()],
            watched_tables: Some(vec![
                TableName::new("audit", "zerver_message"),
                TableName::new("public", "django_session"),
            ]),
            ..Default::default()
        };

        assert_eq!(
            config.select_tables(tables()),
            vec![TableName::new("audit", "zerver_message")]
        );
    }

    #[test]
    fn trigger_name_is_derived_from_table() {
        let binding = TriggerBinding::new(
            TableName::new("public", "zerver_message"),
            &CaptureConfig::default(),
        );
        assert_eq!(binding.trigger_name(), "notify_public__zerver_message");
        assert_eq!(
            binding.drop_statement(),
            r#"DROP TRIGGER IF EXISTS "notify_public__zerver_message" ON "public"."zerver_message""#
        );
    }

    #[test]
    fn create_statement_is_row_level_after_trigger() {
        let binding =
            TriggerBinding::new(TableName::new("public", "t"), &CaptureConfig::default());
        let sql = binding.create_statement();

        assert!(sql.starts_with(r#"CREATE TRIGGER "notify_public__t""#));
        assert!(sql.contains("AFTER INSERT OR UPDATE OR DELETE"));
        assert!(sql.contains(r#"ON "public"."t""#));
        assert!(sql.contains("FOR EACH ROW"));
        assert!(sql.contains(r#"EXECUTE PROCEDURE "notify_mirror"()"#));
    }

    #[test]
    fn function_notifies_on_channel() {
        let sql = notify_function_statement("notify_mirror", "mirror");

        assert!(sql.starts_with(r#"CREATE OR REPLACE FUNCTION "notify_mirror"()"#));
        assert!(sql.contains("pg_notify('mirror',"));
        assert!(sql.contains(r#"'{ "schema": '"#));
        assert!(sql.contains(r#"', "OLD": ' || row_to_json(OLD)::text"#));
        assert!(sql.contains(r#"', "NEW": ' || row_to_json(NEW)::text"#));
        assert!(sql.contains("'}');"));
    }

    #[test]
    fn channel_literal_is_escaped() {
        let sql = notify_function_statement("notify_mirror", "it's");
        assert!(sql.contains("pg_notify('it''s',"));
    }
}
