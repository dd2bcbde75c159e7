use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use tracing::debug;

use batchrelay_core::BatchPayload;

use super::error::DeliveryError;

/// One raw delivery attempt, no protection policies.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, batch: &BatchPayload, token: &str) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<T: BatchTransport + ?Sized> BatchTransport for Arc<T> {
    async fn send(&self, batch: &BatchPayload, token: &str) -> Result<(), DeliveryError> {
        (**self).send(batch, token).await
    }
}

/// `POST upload_url` with the batch as JSON and a bearer token.
#[derive(Debug, Clone)]
pub struct HttpBatchTransport {
    client: reqwest::Client,
    upload_url: String,
}

impl HttpBatchTransport {
    pub fn new(client: reqwest::Client, upload_url: impl Into<String>) -> Self {
        Self {
            client,
            upload_url: upload_url.into(),
        }
    }

    /// Client with the given connect and whole-request timeouts.
    pub fn build_client(
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
    }
}

fn transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout(e.to_string())
    } else {
        DeliveryError::Network(e.to_string())
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn send(&self, batch: &BatchPayload, token: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.upload_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(batch)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            debug!(batch_id = %batch.batch_id, status = status.as_u16(), "batch accepted");
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(DeliveryError::TokenRejected);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
