//! Config file loader and serialization.

use crate::config::CheckpointerConfig;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file when no CLI argument is given.
pub const CONFIG_PATH_ENV: &str = "CHECKPOINTER_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

/// Validate config path (.json or .toml extension required).
fn config_format(path: &Path) -> Result<ConfigFormat, ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(ConfigFormat::Json),
        Some("toml") => Ok(ConfigFormat::Toml),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Configuration file must have .json or .toml extension, got .{}",
            ext
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Configuration file must have .json or .toml extension".to_string(),
        )),
    }
}

/// Load config from a JSON or TOML file.
pub fn load_config_from_file(path: &Path) -> Result<CheckpointerConfig, ConfigError> {
    let format = config_format(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    match format {
        ConfigFormat::Json => serde_json::from_str(&content).map_err(ConfigError::InvalidJson),
        ConfigFormat::Toml => {
            toml::from_str(&content).map_err(|e| ConfigError::InvalidToml(e.to_string()))
        }
    }
}

/// Save config to a JSON or TOML file, chosen by extension.
pub fn save_config_to_file(config: &CheckpointerConfig, path: &Path) -> Result<(), ConfigError> {
    let format = config_format(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let content = match format {
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).map_err(ConfigError::InvalidJson)?
        }
        ConfigFormat::Toml => {
            toml::to_string_pretty(config).map_err(|e| ConfigError::InvalidToml(e.to_string()))?
        }
    };

    fs::write(path, content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Config path from the first CLI argument, falling back to `CHECKPOINTER_CONFIG`.
pub fn config_path_from_args<I>(mut args: I) -> Option<PathBuf>
where
    I: Iterator<Item = String>,
{
    // Skip argv[0].
    args.next();
    args.next()
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

/// Load the file (or defaults), apply environment overrides, validate.
pub fn load_runtime_config(path: Option<&Path>) -> Result<CheckpointerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config_from_file(path)?,
        None => CheckpointerConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::selector::{MarkerRule, MarkerSource, Requirement};
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("checkpointer.json");

        let mut original = CheckpointerConfig::default();
        original.node_name = "node-a".to_string();
        original.reconcile_interval_secs = 10;
        original.agent.use_secure_endpoint = true;

        save_config_to_file(&original, &config_path).expect("Failed to save config");
        let loaded = load_config_from_file(&config_path).expect("Failed to load config");
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_partial_toml_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("checkpointer.toml");
        fs::write(
            &config_path,
            r#"
node_name = "node-a"
reconcile_interval_secs = 7

[eligibility]
source = "label"
key = "checkpoint"
operator = "equals"
values = ["true"]

[agent]
use_secure_endpoint = true
"#,
        )
        .unwrap();

        let config = load_config_from_file(&config_path).unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.reconcile_interval_secs, 7);
        assert_eq!(config.request_timeout_secs, 5);
        assert!(config.agent.use_secure_endpoint);
        assert_eq!(config.agent.secure_port, 10250);
        assert_eq!(
            config.eligibility,
            MarkerRule {
                source: MarkerSource::Label,
                requirement: Requirement::equals("checkpoint", "true"),
            }
        );
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config_from_file(Path::new("/nonexistent/checkpointer.json"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.json");
        fs::write(&config_path, "{ not json").unwrap();
        assert!(matches!(
            load_config_from_file(&config_path),
            Err(ConfigError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_extension() {
        assert!(matches!(
            load_config_from_file(Path::new("/etc/checkpointer.yaml")),
            Err(ConfigError::ValidationFailed(_))
        ));
        assert!(config_format(Path::new("")).is_err());
    }

    #[test]
    fn test_config_path_from_args() {
        let args = vec!["pod-checkpointer".to_string(), "/etc/cp.toml".to_string()];
        assert_eq!(
            config_path_from_args(args.into_iter()),
            Some(PathBuf::from("/etc/cp.toml"))
        );
    }
}
