//! Capture against a live database.
//!
//! Run with: cargo test -p pg_mirror --test postgres_capture -- --ignored
//! Connection settings come from PG_MIRROR_TEST_{HOST,PORT,DB,USER,PASSWORD}.

use std::time::Duration;

use futures::{Stream, StreamExt};
use pg_mirror::{
    clients::postgres::PostgresConfig,
    conversions::change_record::{ChangeRecord, Operation},
    pipeline::sources::{
        postgres::{stream::NotificationStreamError, triggers::CaptureConfig, PostgresSource},
        Source,
    },
    table::TableName,
};
use serde_json::json;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn test_config() -> PostgresConfig {
    PostgresConfig {
        host: env_or("PG_MIRROR_TEST_HOST", "localhost"),
        port: env_or("PG_MIRROR_TEST_PORT", "5432").parse().unwrap(),
        database: env_or("PG_MIRROR_TEST_DB", "postgres"),
        username: env_or("PG_MIRROR_TEST_USER", "postgres"),
        password: std::env::var("PG_MIRROR_TEST_PASSWORD").ok(),
    }
}

async fn admin_client(config: &PostgresConfig) -> Client {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.username);
    if let Some(ref password) = config.password {
        pg_config.password(password);
    }
    let (client, connection) = pg_config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn capture_config() -> CaptureConfig {
    CaptureConfig {
        channel: "pg_mirror_test".to_string(),
        procedure: "pg_mirror_test_notify".to_string(),
        excluded_tables: vec!["mirror_ephemeral".to_string()],
        watched_tables: Some(vec![
            TableName::new("public", "mirror_items"),
            TableName::new("public", "mirror_ephemeral"),
        ]),
    }
}

async fn trigger_count(client: &Client, table: &str) -> i64 {
    client
        .query_one(
            "SELECT count(*) FROM pg_trigger WHERE tgrelid = $1::text::regclass AND NOT tgisinternal",
            &[&table],
        )
        .await
        .unwrap()
        .get(0)
}

async fn next_change<S>(changes: &mut S) -> ChangeRecord
where
    S: Stream<Item = Result<ChangeRecord, NotificationStreamError>> + Unpin,
{
    timeout(Duration::from_secs(5), changes.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn captures_row_changes() {
    let config = test_config();
    let admin = admin_client(&config).await;
    admin
        .batch_execute(
            "DROP TABLE IF EXISTS mirror_items, mirror_ephemeral;
             CREATE TABLE mirror_items (id int PRIMARY KEY, content text);
             CREATE TABLE mirror_ephemeral (id int);",
        )
        .await
        .unwrap();

    // Installing twice must leave exactly one trigger behind.
    let mut first = PostgresSource::new(&config, capture_config()).await.unwrap();
    first.prepare().await.unwrap();
    let mut source = PostgresSource::new(&config, capture_config()).await.unwrap();
    source.prepare().await.unwrap();
    assert_eq!(source.bindings().len(), 1);
    assert_eq!(trigger_count(&admin, "public.mirror_items").await, 1);
    assert_eq!(trigger_count(&admin, "public.mirror_ephemeral").await, 0);

    let mut changes = source.into_stream().await.unwrap();

    admin
        .batch_execute(
            "INSERT INTO mirror_ephemeral VALUES (1);
             INSERT INTO mirror_items VALUES (1, 'null');
             UPDATE mirror_items SET content = NULL WHERE id = 1;
             DELETE FROM mirror_items WHERE id = 1;",
        )
        .await
        .unwrap();

    let insert = next_change(&mut changes).await;
    assert_eq!(insert.operation(), Operation::Insert);
    assert_eq!(insert.table(), &TableName::new("public", "mirror_items"));
    assert_eq!(insert.after().unwrap()["content"], json!("null"));
    assert!(insert.before().is_none());

    let update = next_change(&mut changes).await;
    assert_eq!(update.operation(), Operation::Update);
    assert_eq!(update.before().unwrap()["content"], json!("null"));
    assert_eq!(update.after().unwrap()["content"], json!(null));

    let delete = next_change(&mut changes).await;
    assert_eq!(delete.operation(), Operation::Delete);
    assert!(delete.after().is_none());

    first.uninstall().await.unwrap();
    assert_eq!(trigger_count(&admin, "public.mirror_items").await, 0);
}
