use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::clients::postgres::{NotifyClient, NotifyClientError, PostgresConfig, RawNotifications};

use self::{
    stream::NotificationStream,
    triggers::{CaptureConfig, TriggerBinding, TriggerInstallError},
};

use super::{Source, SourceError};

pub mod stream;
pub mod triggers;

#[derive(Debug, Error)]
pub enum PostgresSourceError {
    #[error("notify client error: {0}")]
    NotifyClient(#[from] NotifyClientError),

    #[error("trigger installation failed: {0}")]
    TriggerInstall(#[from] TriggerInstallError),
}

/// Captures row changes of a database through notify triggers.
pub struct PostgresSource {
    client: NotifyClient,
    capture_config: CaptureConfig,
    bindings: Vec<TriggerBinding>,
}

impl PostgresSource {
    pub async fn new(
        config: &PostgresConfig,
        capture_config: CaptureConfig,
    ) -> Result<PostgresSource, PostgresSourceError> {
        let client = NotifyClient::connect_no_tls(config).await?;
        info!(
            "connected to {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(PostgresSource {
            client,
            capture_config,
            bindings: vec![],
        })
    }

    pub fn bindings(&self) -> &[TriggerBinding] {
        &self.bindings
    }

    pub async fn uninstall(&mut self) -> Result<Vec<TriggerBinding>, PostgresSourceError> {
        let removed = triggers::uninstall(&mut self.client, &self.capture_config).await?;
        self.bindings.clear();
        Ok(removed)
    }
}

#[async_trait]
impl Source for PostgresSource {
    type Stream = NotificationStream<RawNotifications>;

    async fn prepare(&mut self) -> Result<(), SourceError> {
        self.bindings = triggers::install(&mut self.client, &self.capture_config)
            .await
            .map_err(PostgresSourceError::TriggerInstall)?;
        Ok(())
    }

    async fn into_stream(self) -> Result<Self::Stream, SourceError> {
        let raw = self
            .client
            .listen(&self.capture_config.channel)
            .await
            .map_err(PostgresSourceError::NotifyClient)?;
        Ok(NotificationStream::new(raw))
    }
}
