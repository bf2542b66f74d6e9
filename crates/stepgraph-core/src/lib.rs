pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StepGraphError};
pub use event::EventBus;
pub use state::{FieldPolicy, RunState, StateSchema, StateUpdate};
pub use types::*;
