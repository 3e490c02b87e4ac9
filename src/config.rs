//! Reader options, loadable from a JSON file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Reader options applied when a capture is opened.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// Add the capture's OFFSET option to every record timestamp.
    pub apply_time_offset: bool,
    /// Reject the capture on a malformed event format. When false the bad
    /// format is logged and skipped.
    pub strict_catalog: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            apply_time_offset: true,
            strict_catalog: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl TraceConfig {
    /// Load a config from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&buf).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TraceConfig::default();
        assert!(config.apply_time_offset);
        assert!(config.strict_catalog);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"strict_catalog": false}}"#).unwrap();
        let config = TraceConfig::from_json_file(file.path()).unwrap();
        assert!(config.apply_time_offset);
        assert!(!config.strict_catalog);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bogus": 1}}"#).unwrap();
        assert!(matches!(
            TraceConfig::from_json_file(file.path()),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            TraceConfig::from_json_file("/nonexistent/tracecmd.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
