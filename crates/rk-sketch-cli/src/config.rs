//! CLI configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use rk_sketch::constants::DEFAULT_COINCIDENCE_THRESHOLD;

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE: &str = "rk-sketch.ron";

/// Document encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum Format {
    #[default]
    Ron,
    Json,
}

impl Format {
    /// Encoding implied by a file extension, if any
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "ron" => Some(Format::Ron),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Coincidence threshold for sketches the CLI creates
    pub default_threshold: f64,
    /// Encoding used when neither the flag nor the file extension decides
    pub output_format: Format,
    /// Log filter used when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_COINCIDENCE_THRESHOLD,
            output_format: Format::Ron,
            log_filter: "rk_sketch=info,rk_sketch_cli=info".to_string(),
        }
    }
}

impl CliConfig {
    /// Read a configuration file. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        ron::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Pick the encoding for `path`: explicit flag, then extension, then config
    pub fn format_for(&self, path: &Path, flag: Option<Format>) -> Format {
        flag.or_else(|| Format::from_path(path)).unwrap_or(self.output_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "(default_threshold: 0.5, output_format: Json)").unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.default_threshold, 0.5);
        assert_eq!(config.output_format, Format::Json);
        assert_eq!(config.log_filter, CliConfig::default().log_filter);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "(default_threshold: \"wide\")").unwrap();
        assert!(CliConfig::load(&path).is_err());
    }

    #[test]
    fn test_format_resolution() {
        let config = CliConfig::default();
        assert_eq!(config.format_for(Path::new("a.json"), None), Format::Json);
        assert_eq!(config.format_for(Path::new("a.json"), Some(Format::Ron)), Format::Ron);
        assert_eq!(config.format_for(Path::new("a.sketch"), None), Format::Ron);
    }
}
