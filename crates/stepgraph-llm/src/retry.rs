use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use stepgraph_core::config::RetryConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::*;

/// A chat model that retries transient failures and then falls back to
/// alternative models.
pub struct RetryingModel {
    primary: Box<dyn ChatModel>,
    fallbacks: Vec<(String, Box<dyn ChatModel>)>,
    retry_config: RetryConfig,
}

impl RetryingModel {
    pub fn new(primary: Box<dyn ChatModel>, retry_config: RetryConfig) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            retry_config,
        }
    }

    /// Add a fallback model, tried once each after the primary gives up.
    pub fn with_fallback(mut self, label: impl Into<String>, model: Box<dyn ChatModel>) -> Self {
        self.fallbacks.push((label.into(), model));
        self
    }
}

fn is_retryable(e: &StepGraphError) -> bool {
    match e {
        StepGraphError::ModelRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ChatModel for RetryingModel {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        let tools = tools.to_vec();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.complete(messages.clone(), &tools).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying model request"
                        );
                        tokio::time::sleep(backoff).await;
                        last_err = Some(e);
                    }
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary model exhausted, trying fallbacks");
            }
            for (label, model) in &self.fallbacks {
                match model.complete(messages.clone(), &tools).await {
                    Ok(reply) => {
                        info!(model = %label, "Fell back to alternative model");
                        return Ok(reply);
                    }
                    Err(e) => {
                        warn!(model = %label, error = %e, "Fallback model also failed");
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| StepGraphError::ModelRequest("all models failed".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepgraph_test_utils::ScriptedModel;

    struct Shared(Arc<ScriptedModel>);

    impl ChatModel for Shared {
        fn complete(
            &self,
            messages: Vec<ChatMessage>,
            tools: &[ToolSchema],
        ) -> BoxFuture<'_, Result<ChatMessage>> {
            self.0.complete(messages, tools)
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let scripted = Arc::new(ScriptedModel::new(vec![]));
        scripted.push_error("HTTP 503 Service Unavailable");
        scripted.push(ChatMessage::assistant_text("recovered"));

        let model = RetryingModel::new(Box::new(Shared(Arc::clone(&scripted))), fast_retry(2));
        let reply = model.complete(vec![ChatMessage::user("hi")], &[]).await.unwrap();
        assert_eq!(reply.text(), "recovered");
        assert_eq!(scripted.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_client_errors() {
        let scripted = Arc::new(ScriptedModel::new(vec![]));
        scripted.push_error("HTTP 400 Bad Request");

        let model = RetryingModel::new(Box::new(Shared(Arc::clone(&scripted))), fast_retry(3));
        let err = model.complete(vec![ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(scripted.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_after_exhaustion() {
        let primary = Arc::new(ScriptedModel::new(vec![]));
        primary.push_error("HTTP 429 Too Many Requests");
        primary.push_error("HTTP 429 Too Many Requests");
        let backup = Arc::new(ScriptedModel::new(vec![ChatMessage::assistant_text("backup")]));

        let model = RetryingModel::new(Box::new(Shared(Arc::clone(&primary))), fast_retry(1))
            .with_fallback("backup", Box::new(Shared(Arc::clone(&backup))));
        let reply = model.complete(vec![ChatMessage::user("hi")], &[]).await.unwrap();
        assert_eq!(reply.text(), "backup");
        assert_eq!(primary.calls(), 2);
        assert_eq!(backup.calls(), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
        };
        let d = calculate_backoff(8, &cfg);
        assert!(d <= Duration::from_millis(6000));
        assert!(d >= Duration::from_millis(4000));
    }
}
