//! ---
//! hive_section: "01-core-functionality"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Shared primitives and utilities for Hive components."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Structural checks run after a configuration document has been parsed.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// A parsed configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig<T> {
    pub config: T,
    pub source: PathBuf,
}

/// Load the first configuration file that exists.
///
/// When `env_var` is set to a non-empty path that file is used unconditionally
/// and the candidate list is ignored.
pub fn load_with_source<T, P>(candidates: &[P], env_var: &str) -> Result<LoadedConfig<T>>
where
    T: DeserializeOwned + Validate,
    P: AsRef<Path>,
{
    if let Ok(env_path) = std::env::var(env_var) {
        if !env_path.trim().is_empty() {
            let path = PathBuf::from(env_path);
            let config = from_path(&path)?;
            return Ok(LoadedConfig {
                config,
                source: path,
            });
        }
    }

    for candidate in candidates {
        if candidate.as_ref().exists() {
            let path = candidate.as_ref().to_path_buf();
            let config = from_path(&path)?;
            return Ok(LoadedConfig {
                config,
                source: path,
            });
        }
    }

    Err(anyhow!(
        "no configuration files found. inspected: {}",
        candidates
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

/// Parse and validate a single TOML configuration file.
pub fn from_path<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    debug!(config_path = %path.display(), "loading configuration");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    let config = toml::from_str::<T>(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Logging sinks and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the daily rolling JSON log; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Send the console layer to stderr instead of stdout.
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
            stderr: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl Validate for Sample {
        fn validate(&self) -> Result<()> {
            if self.name.is_empty() {
                return Err(anyhow!("name must not be empty"));
            }
            Ok(())
        }
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("present.toml");
        fs::write(&present, "name = \"discord\"\n[logging]\nformat = \"structured-json\"\nstderr = true\n")
            .unwrap();

        let loaded: LoadedConfig<Sample> =
            load_with_source(&[&missing, &present], "HIVE_COMMON_TEST_UNSET").unwrap();
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.name, "discord");
        assert_eq!(loaded.config.logging.format, LogFormat::StructuredJson);
        assert!(loaded.config.logging.stderr);
    }

    #[test]
    fn env_override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("fallback.toml");
        let preferred = dir.path().join("preferred.toml");
        fs::write(&fallback, "name = \"fallback\"\n").unwrap();
        fs::write(&preferred, "name = \"preferred\"\n").unwrap();

        std::env::set_var("HIVE_COMMON_TEST_OVERRIDE", &preferred);
        let loaded: LoadedConfig<Sample> =
            load_with_source(&[&fallback], "HIVE_COMMON_TEST_OVERRIDE").unwrap();
        std::env::remove_var("HIVE_COMMON_TEST_OVERRIDE");

        assert_eq!(loaded.config.name, "preferred");
        assert!(loaded.config.logging.directory.is_none());
        assert!(!loaded.config.logging.stderr);
    }

    #[test]
    fn validation_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.toml");
        fs::write(&path, "name = \"\"\n").unwrap();

        let err = from_path::<Sample>(&path).unwrap_err();
        assert!(err.to_string().contains("name must not be empty"));
    }

    #[test]
    fn missing_candidates_list_inspected_paths() {
        let err =
            load_with_source::<Sample, _>(&["/nonexistent/hive.toml"], "HIVE_COMMON_TEST_UNSET")
                .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hive.toml"));
    }
}
