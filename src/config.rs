//! Solver configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Force verbose scheduler tracing on, equivalent to
    /// `KILN_SCHEDULER_DEBUG=1`.
    pub scheduler_debug: bool,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. `info` or `kiln=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

impl SolverConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SolverConfig::default();
        assert!(!config.scheduler_debug);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = SolverConfig::from_json(r#"{"scheduler_debug": true}"#).unwrap();
        assert!(config.scheduler_debug);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn log_format_parses_snake_case() {
        let config =
            SolverConfig::from_json(r#"{"logging": {"format": "json", "filter": "debug"}}"#)
                .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "debug");
    }
}
