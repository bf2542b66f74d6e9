pub mod clock;
pub mod web_fetch;
