pub mod config;
pub mod handlers;
pub mod observability;
pub mod server;

pub use config::{AppConfig, BulkExportConfig, LoggingConfig, ServerConfig};
pub use observability::{apply_logging_level, init_tracing};
pub use server::{AppState, BulkExportApp, BulkExportServer, ServerBuilder, build_app, router};
