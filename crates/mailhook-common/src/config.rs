//! Configuration for Mailhook

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "MAILHOOK_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Hook pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Per-plugin settings, keyed by plugin name
    #[serde(default)]
    pub plugins: HashMap<String, toml::Value>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in trace headers and generated identifiers
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Hook pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Plugins to load, in execution order
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Per-handler time limit in milliseconds. Unset means no limit.
    pub handler_timeout_ms: Option<u64>,

    /// Consecutive faults before a plugin is bypassed, 0 (the default)
    /// disables. Faults count across transactions.
    #[serde(default)]
    pub circuit_threshold: u32,

    /// Seconds a bypassed plugin stays bypassed
    #[serde(default = "default_circuit_reset")]
    pub circuit_reset_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            handler_timeout_ms: None,
            circuit_threshold: 0,
            circuit_reset_secs: default_circuit_reset(),
        }
    }
}

fn default_circuit_reset() -> u64 {
    60
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `MAILHOOK_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            debug!(path = %path, "Loading configuration from {}", CONFIG_ENV);
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./mailhook.toml"),
            PathBuf::from("/etc/mailhook/mailhook.toml"),
        ];

        for path in paths {
            if path.exists() {
                debug!(path = %path.display(), "Loading configuration");
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Settings table of a plugin, if any
    pub fn plugin_settings(&self, name: &str) -> Option<&toml::Value> {
        self.plugins.get(name)
    }

    fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for name in &self.pipeline.plugins {
            if name.trim().is_empty() {
                return Err(crate::Error::Config(
                    "Empty plugin name in pipeline.plugins".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Plugin {} listed twice in pipeline.plugins",
                    name
                )));
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(crate::Error::Config(format!(
                "Unknown log format: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.hostname, "localhost");
        assert_eq!(config.logging.level, "info");
        assert!(config.pipeline.plugins.is_empty());
        assert_eq!(config.pipeline.handler_timeout_ms, None);
        assert_eq!(config.pipeline.circuit_threshold, 0);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mx.example.com"

[logging]
level = "debug"
format = "text"

[pipeline]
plugins = ["message_id", "spam_score", "footer"]
handler_timeout_ms = 2000

[plugins.spam_score]
reject_threshold = 12.5

[plugins.footer]
text = "-- sent via example.com"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.hostname, "mx.example.com");
        assert_eq!(
            config.pipeline.plugins,
            vec!["message_id", "spam_score", "footer"]
        );
        assert_eq!(config.pipeline.handler_timeout_ms, Some(2000));

        let spam = config.plugin_settings("spam_score").unwrap();
        assert_eq!(
            spam.get("reject_threshold").and_then(|v| v.as_float()),
            Some(12.5)
        );
        assert!(config.plugin_settings("srs").is_none());
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let toml = r#"
[pipeline]
plugins = ["footer", "footer"]
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let toml = r#"
[logging]
format = "xml"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nplugins = [\"received\"]").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pipeline.plugins, vec!["received"]);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/mailhook.toml")).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
