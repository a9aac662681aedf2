use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{DeliveryError, DeliveryStep, DeliverySink, FinalizationResult, SubmissionReceipt};

#[derive(Debug, Clone)]
pub struct RNodeConfig {
    /// Endpoint accepting unsigned deploys. Signing happens behind it.
    pub submit_url: String,
    /// Endpoint asking the validator to propose a block.
    pub finalize_url: String,
    pub phlo_limit: u64,
    pub phlo_price: u64,
    pub request_timeout: Duration,
}

impl RNodeConfig {
    pub fn new(submit_url: impl Into<String>, finalize_url: impl Into<String>) -> RNodeConfig {
        RNodeConfig {
            submit_url: submit_url.into(),
            finalize_url: finalize_url.into(),
            phlo_limit: 100_000_000,
            phlo_price: 1,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeployRequest<'a> {
    term: &'a str,
    phlo_limit: u64,
    phlo_price: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployResponse {
    deploy_id: Option<String>,
    sig: Option<String>,
}

/// Delivers batches to an RNode validator: the batch body is sent as one
/// deploy, then a block is proposed.
pub struct RNodeSink {
    client: Client,
    config: RNodeConfig,
}

impl RNodeSink {
    pub fn new(config: RNodeConfig) -> Result<RNodeSink, DeliveryError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(RNodeSink { client, config })
    }

    async fn read_success(step: DeliveryStep, response: Response) -> Result<String, DeliveryError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                step,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// The relay answers either with `{"deployId": ...}` / `{"sig": ...}` or with
/// the bare deploy id as text.
fn parse_receipt_id(body: &str) -> Result<String, DeliveryError> {
    let invalid = |reason: &str| DeliveryError::InvalidResponse {
        step: DeliveryStep::Submit,
        reason: reason.to_string(),
    };

    let body = body.trim();
    if body.starts_with('{') {
        let response: DeployResponse =
            serde_json::from_str(body).map_err(|e| invalid(&e.to_string()))?;
        return response
            .deploy_id
            .or(response.sig)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| invalid("response has neither deployId nor sig"));
    }
    if body.is_empty() {
        return Err(invalid("empty response"));
    }
    Ok(body.to_string())
}

#[async_trait]
impl DeliverySink for RNodeSink {
    async fn submit(&self, body: &str) -> Result<SubmissionReceipt, DeliveryError> {
        let request = DeployRequest {
            term: body,
            phlo_limit: self.config.phlo_limit,
            phlo_price: self.config.phlo_price,
        };
        let preview: String = body.chars().take(50).collect();
        info!(
            "sending deploy (phlo_limit: {}, term: {preview:?})",
            self.config.phlo_limit
        );

        let response = self
            .client
            .post(&self.config.submit_url)
            .json(&request)
            .send()
            .await?;
        let text = Self::read_success(DeliveryStep::Submit, response).await?;

        Ok(SubmissionReceipt {
            id: parse_receipt_id(&text)?,
            submitted_at: Utc::now(),
        })
    }

    async fn finalize(&self) -> Result<FinalizationResult, DeliveryError> {
        let response = self.client.post(&self.config.finalize_url).send().await?;
        let message = Self::read_success(DeliveryStep::Finalize, response).await?;
        Ok(FinalizationResult {
            message: message.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_from_json_deploy_id() {
        assert_eq!(
            parse_receipt_id(r#"{"deployId": "3045abc"}"#).unwrap(),
            "3045abc"
        );
    }

    #[test]
    fn receipt_falls_back_to_sig() {
        assert_eq!(parse_receipt_id(r#"{"sig": "ff00"}"#).unwrap(), "ff00");
    }

    #[test]
    fn receipt_from_plain_text() {
        assert_eq!(
            parse_receipt_id("Success!\n").unwrap(),
            "Success!"
        );
    }

    #[test]
    fn empty_receipt_is_invalid() {
        assert!(matches!(
            parse_receipt_id("  "),
            Err(DeliveryError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_receipt_id("{}"),
            Err(DeliveryError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn deploy_request_uses_camel_case() {
        let request = DeployRequest {
            term: "Nil",
            phlo_limit: 10,
            phlo_price: 1,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"term":"Nil","phloLimit":10,"phloPrice":1}"#
        );
    }
}
