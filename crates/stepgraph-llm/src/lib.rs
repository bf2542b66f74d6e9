pub mod providers;
pub mod retry;

use stepgraph_core::config::ModelConfig;
use stepgraph_core::traits::ChatModel;

pub use providers::azure::AzureChatModel;
pub use providers::openai::OpenAiChatModel;
pub use retry::RetryingModel;

/// Create a chat model based on the provider name.
pub fn create_model(config: &ModelConfig) -> Box<dyn ChatModel> {
    match config.provider.as_str() {
        "azure" | "azure_openai" => Box::new(AzureChatModel::new(config.clone())),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiChatModel::new(config.clone())),
    }
}

/// Create a chat model, wrapped in retry handling when `[model.retry]` is set.
pub fn build_model(config: &ModelConfig) -> Box<dyn ChatModel> {
    let model = create_model(config);
    match &config.retry {
        Some(retry) => Box::new(RetryingModel::new(model, retry.clone())),
        None => model,
    }
}
