use std::path::PathBuf;

use serde::Deserialize;

/// `[logging]`: where log output goes besides stdout
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Mirror every event to this file, appending
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Colour codes on stdout
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: None, ansi: default_ansi() }
    }
}

fn default_ansi() -> bool {
    true
}
