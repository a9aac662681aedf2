use std::future::poll_fn;

use futures::{stream::BoxStream, StreamExt};
use postgres_protocol::escape::escape_identifier;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls};
use tracing::{error, info, warn};

use crate::table::TableName;

#[derive(Debug, Error)]
pub enum NotifyClientError {
    #[error("tokio_postgres error: {0}")]
    TokioPostgres(#[from] tokio_postgres::Error),

    #[error("notification connection closed")]
    ConnectionClosed,
}

/// Raw notification payloads in the order the server delivered them.
pub type RawNotifications = BoxStream<'static, Result<String, NotifyClientError>>;

type ConnectionMessage = Result<tokio_postgres::Notification, tokio_postgres::Error>;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
}

/// A plain (non replication) connection used to install capture triggers
/// and then to LISTEN on the notification channel.
pub struct NotifyClient {
    client: Client,
    notifications: mpsc::UnboundedReceiver<ConnectionMessage>,
}

impl NotifyClient {
    pub async fn connect_no_tls(config: &PostgresConfig) -> Result<NotifyClient, NotifyClientError> {
        let mut pg_config = Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.username);
        if let Some(ref password) = config.password {
            pg_config.password(password);
        }

        let (client, mut connection) = pg_config.connect(NoTls).await?;
        let (tx, notifications) = mpsc::unbounded_channel();

        // The connection has to be polled for queries to make progress, so it
        // is driven here and notifications are forwarded in arrival order.
        tokio::spawn(async move {
            while let Some(message) = poll_fn(|cx| connection.poll_message(cx)).await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(Ok(notification)).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        info!("postgres notice: {notice}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("postgres connection error: {e}");
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
            info!("postgres connection closed");
        });

        Ok(NotifyClient {
            client,
            notifications,
        })
    }

    /// User tables of the connected database, i.e. base tables outside the
    /// system schemas.
    pub async fn get_table_names(&self) -> Result<Vec<TableName>, NotifyClientError> {
        let rows = self
            .client
            .query(
                r#"
                SELECT table_schema::text, table_name::text
                FROM information_schema.tables
                WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
                  AND table_schema NOT LIKE 'pg_toast%'
                  AND table_type = 'BASE TABLE'
                ORDER BY table_schema, table_name
                "#,
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| TableName::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    /// Runs all statements in a single transaction. Nothing is applied if any
    /// statement fails.
    pub async fn execute_in_transaction(
        &mut self,
        statements: &[String],
    ) -> Result<(), NotifyClientError> {
        let txn = self.client.transaction().await?;
        for statement in statements {
            txn.batch_execute(statement).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Subscribes to `channel` and hands the connection over to the returned
    /// stream. The stream ends with [`NotifyClientError::ConnectionClosed`]
    /// when the server goes away.
    pub async fn listen(self, channel: &str) -> Result<RawNotifications, NotifyClientError> {
        self.client
            .batch_execute(&format!("LISTEN {}", escape_identifier(channel)))
            .await?;
        info!("listening on channel {channel}");

        let channel = channel.to_string();
        let NotifyClient {
            client,
            notifications,
        } = self;

        let stream = futures::stream::unfold(
            Some((client, notifications, channel)),
            |state| async move {
                let (client, mut notifications, channel) = state?;
                loop {
                    match notifications.recv().await {
                        Some(Ok(notification)) if notification.channel() != channel => {
                            warn!(
                                "ignoring notification on unexpected channel {}",
                                notification.channel()
                            );
                        }
                        Some(Ok(notification)) => {
                            let payload = notification.payload().to_string();
                            return Some((Ok(payload), Some((client, notifications, channel))));
                        }
                        Some(Err(e)) => return Some((Err(NotifyClientError::from(e)), None)),
                        None => return Some((Err(NotifyClientError::ConnectionClosed), None)),
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}
