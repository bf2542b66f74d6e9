use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use stepgraph_core::config::ModelConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::*;

use super::openai::{send_chat, ChatRequest};

const DEFAULT_API_VERSION: &str = "2024-06-01";

/// Azure OpenAI client. Uses the same wire format as OpenAI but a
/// deployment-scoped endpoint and an `api-key` header instead of a Bearer token.
pub struct AzureChatModel {
    http: Client,
    config: ModelConfig,
}

impl AzureChatModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn endpoint_url(&self) -> Result<String> {
        let endpoint = self
            .config
            .azure_endpoint
            .as_deref()
            .ok_or_else(|| StepGraphError::Config("Azure: azure_endpoint is required".into()))?;
        let deployment = self
            .config
            .azure_deployment
            .as_deref()
            .unwrap_or(self.config.model_id.as_str());
        let api_version = self
            .config
            .azure_api_version
            .as_deref()
            .unwrap_or(DEFAULT_API_VERSION);

        Ok(format!(
            "{}/openai/deployments/{deployment}/chat/completions?api-version={api_version}",
            endpoint.trim_end_matches('/')
        ))
    }
}

impl ChatModel for AzureChatModel {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        let body = ChatRequest::new(&self.config, None, messages, tools);

        Box::pin(async move {
            let url = self.endpoint_url()?;
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| StepGraphError::Config("Azure: api_key is required".into()))?;

            debug!(url = %url, "Requesting Azure completion");
            let req = self.http.post(&url).header("api-key", api_key);
            send_chat(req, &body).await
        })
    }
}
