use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ExtractionError;
use super::protocol::ExtractionConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest<'a> {
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<&'a str>,
}

impl<'a> ExtractionRequest<'a> {
    pub fn new(
        url: &'a str,
        title: Option<&'a str>,
        content: &'a str,
        config: &'a ExtractionConfig,
    ) -> Self {
        Self {
            url,
            title,
            content,
            schema: config.schema.as_ref(),
            instruction: config.instruction.as_deref(),
        }
    }
}

/// Schema-guided structured extraction over page content.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Value, ExtractionError>;
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    data: Option<Value>,
}

/// Posts the page to an extraction endpoint and expects `{"data": ...}` back.
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExtractor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Value, ExtractionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExtractionError::Status(response.status().as_u16()));
        }
        let body = response.json::<ExtractionResponse>().await?;
        match body.data {
            Some(Value::Null) | None => Err(ExtractionError::Empty),
            Some(data) => Ok(data),
        }
    }
}
