pub mod azure;
pub mod openai;

pub use azure::AzureChatModel;
pub use openai::OpenAiChatModel;
