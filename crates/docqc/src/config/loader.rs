use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::config::schema::{ApiConfig, Config};
use crate::error::ConfigError;
use crate::secrets::{resolve_secret_optional, SecretError};

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Returns the default config location: `~/.docqc/docqc.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".docqc").join("docqc.json"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.watcher.extensions.is_empty() {
        return Err(ConfigError::Validation {
            message: "watcher.extensions must list at least one extension".to_string(),
        });
    }

    for pattern in &config.watcher.exclude {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            });
        }
    }

    let batch = &config.batch;
    if batch.batch_size == 0 || batch.min_batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "batch.batch_size and batch.min_batch_size must be positive".to_string(),
        });
    }
    if batch.min_batch_size > batch.batch_size {
        return Err(ConfigError::Validation {
            message: format!(
                "batch.min_batch_size ({}) exceeds batch.batch_size ({})",
                batch.min_batch_size, batch.batch_size
            ),
        });
    }
    if batch.max_batch_size_mb == 0 || batch.submit_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "batch.max_batch_size_mb and batch.submit_attempts must be positive"
                .to_string(),
        });
    }

    let endpoint = config.api.endpoint.as_str();
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(ConfigError::Validation {
            message: format!(
                "api.endpoint must be an http(s) URL, got '{}'",
                crate::sanitize::redact_url(endpoint)
            ),
        });
    }

    if config.conversion.max_conversions_per_session == 0 {
        return Err(ConfigError::Validation {
            message: "conversion.max_conversions_per_session must be positive".to_string(),
        });
    }

    Ok(())
}

/// Resolves the API key from the configured source, if any.
pub fn resolve_api_key(api: &ApiConfig) -> Result<Option<SecretString>, SecretError> {
    resolve_secret_optional(
        api.api_key.as_deref(),
        api.api_key_file.as_deref(),
        api.api_key_env.as_deref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(
            r#"{ "version": "1.0", "output_directory": "/out", "watch_folders": ["/in"] }"#,
        )
        .unwrap();
        assert_eq!(config.output_directory, "/out");
        assert_eq!(config.watch_dirs(), vec![PathBuf::from("/in")]);
    }

    #[test]
    fn test_load_full_config() {
        let config = load_config_from_str(
            r#"
            {
                "version": "1.0",
                "watch_folders": ["/content/chapters"],
                "output_directory": "/var/docqc",
                "database_path": "/var/docqc/qc.db",
                "watcher": { "extensions": ["docx"], "exclude": ["draft_*"], "debounce_ms": 250 },
                "conversion": { "max_conversions_per_session": 10 },
                "batch": { "batch_size": 8, "min_batch_size": 2, "max_batch_size_mb": 50 },
                "api": { "endpoint": "https://qc.example.com/api", "api_key": "k" },
                "retry": { "max_retries": 5 },
                "logging": { "level": "debug", "json": true }
            }
            "#,
        )
        .unwrap();
        assert_eq!(config.watcher.extensions, vec!["docx"]);
        assert_eq!(config.watcher.debounce_ms, 250);
        assert_eq!(config.conversion.max_conversions_per_session, 10);
        assert_eq!(config.batch.batch_size, 8);
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.logging.json);
    }

    #[test]
    fn test_schema_rejects_unknown_fields() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "output_directory": "/out", "worker_count": 4 }"#,
        );
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_schema_rejects_missing_output_directory() {
        let result = load_config_from_str(r#"{ "version": "1.0" }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_rejects_inconsistent_batch_thresholds() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "output_directory": "/out",
                 "batch": { "batch_size": 3, "min_batch_size": 5 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_rejects_invalid_exclude_glob() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "output_directory": "/out",
                 "watcher": { "exclude": ["[unclosed"] } }"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "output_directory": "/out",
                 "api": { "endpoint": "ftp://qc.example.com" } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_resolve_api_key() {
        let mut api = ApiConfig::default();
        assert!(resolve_api_key(&api).unwrap().is_none());

        api.api_key = Some("secret-key".to_string());
        let key = resolve_api_key(&api).unwrap().unwrap();
        assert_eq!(key.expose_secret(), "secret-key");
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/docqc.json");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
