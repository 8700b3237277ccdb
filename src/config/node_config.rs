use serde::Deserialize;

/// Identity of the running node
#[derive(Debug, Deserialize, Default)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Default log level for the node
fn default_log_level() -> String {
    "info".to_string()
}
