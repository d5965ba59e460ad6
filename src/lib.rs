pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod http_client;
pub mod providers;
pub mod routing;
pub mod server;
pub mod types;
pub mod usage;

pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use types::{CompletionRequest, CompletionResponse};
