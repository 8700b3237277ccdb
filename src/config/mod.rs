mod node_config;
mod logging_config;
pub mod config;

pub use config::{Config, ConfigError};
pub use logging_config::LoggingConfig;
pub use node_config::NodeConfig;
