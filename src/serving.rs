use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::config::ServingSettings;
use crate::error::{BuddyError, Result};

/// One entry of the chat history sent to the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    messages: &'a [ChatMessage],
}

/// Extra outputs the agent behind the endpoint reports with each answer.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CustomOutputs {
    #[serde(default)]
    pub rephrased_query: Option<String>,
    #[serde(default)]
    pub check_query: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub comparison_details: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug, Default)]
struct DatabricksOutput {
    databricks_request_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PredictResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    custom_outputs: Option<CustomOutputs>,
    #[serde(default)]
    databricks_output: Option<DatabricksOutput>,
}

/// A parsed answer from the serving endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAnswer {
    pub content: String,
    pub custom_outputs: CustomOutputs,
    pub request_id: Option<String>,
}

/// Client for a Databricks model serving endpoint.
#[derive(Clone)]
pub struct ServingClient {
    http: Client,
    settings: ServingSettings,
}

impl ServingClient {
    pub fn new(settings: ServingSettings) -> Self {
        Self {
            http: Client::new(),
            settings,
        }
    }

    fn invocations_url(&self) -> String {
        format!(
            "{}/serving-endpoints/{}/invocations",
            self.settings.host, self.settings.endpoint_name
        )
    }

    #[instrument(skip(self, messages), fields(endpoint = %self.settings.endpoint_name, turns = messages.len()))]
    pub async fn predict(&self, messages: &[ChatMessage]) -> Result<ModelAnswer> {
        let url = self.invocations_url();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.token)
            .json(&PredictRequest { messages })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %error_body, "Serving endpoint request failed");
            return Err(BuddyError::Upstream {
                service: "serving endpoint",
                status: status.as_u16(),
                body: error_body,
            });
        }

        let parsed = response.json::<PredictResponse>().await?;
        let first = parsed
            .messages
            .into_iter()
            .next()
            .ok_or(BuddyError::EmptyResponse("serving endpoint"))?;

        debug!(answer = ?first.content, "Received serving endpoint answer");

        Ok(ModelAnswer {
            content: first.content,
            custom_outputs: parsed.custom_outputs.unwrap_or_default(),
            request_id: parsed.databricks_output.and_then(|o| o.databricks_request_id),
        })
    }
}
