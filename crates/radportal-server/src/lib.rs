pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;

pub use config::{AppConfig, LoggingConfig, ServerConfig};
pub use error::ApiError;
pub use server::{AppState, RadportalServer, build_app, connect_backends};
