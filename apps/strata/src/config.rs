//! # Application Configuration
//!
//! `strata.toml` holds defaults for the data directory and the merge
//! switches. Precedence for the data directory, highest first:
//! `--data-dir`, the file's `data_dir`, `STRATA_DATA_DIR`, then `.`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_core::{MergeConfig, MergeError};

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "strata.toml";

/// Environment variable naming the data directory.
pub const DATA_DIR_ENV: &str = "STRATA_DATA_DIR";

/// Maximum config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Contents of `strata.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    /// Directory holding `study.json`, the entity tables and `compute/`.
    pub data_dir: Option<PathBuf>,
    /// Engine switches.
    pub merge: MergeConfig,
}

impl StrataConfig {
    /// Load `path`, or `strata.toml` from the working directory if present.
    ///
    /// An explicit path must exist; the implicit default may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, MergeError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse one TOML file.
    pub fn from_file(path: &Path) -> Result<Self, MergeError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            MergeError::Configuration(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(MergeError::Configuration(format!(
                "Config file '{}' exceeds {} bytes",
                path.display(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)
            .map_err(|e| MergeError::Configuration(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Resolve the data directory from the flag, this file and the environment.
    #[must_use]
    pub fn data_dir(&self, flag: Option<&Path>, env: Option<PathBuf>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .or(env)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Merge switches with CLI overrides applied.
    #[must_use]
    pub fn merge_config(&self, no_pass_through: bool, validate_order: bool) -> MergeConfig {
        let mut config = self.merge.clone();
        if no_pass_through {
            config.pass_through = false;
        }
        if validate_order {
            config.validate_sort_order = true;
        }
        config
    }
}

/// `STRATA_DATA_DIR`, if set and non-empty.
#[must_use]
pub fn data_dir_from_env() -> Option<PathBuf> {
    std::env::var_os(DATA_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config = StrataConfig::parse("").expect("parse");
        assert_eq!(config, StrataConfig::default());
        assert!(config.merge.pass_through);
    }

    #[test]
    fn merge_table_overrides_defaults() {
        let config = StrataConfig::parse(
            "data_dir = \"/srv/study\"\n[merge]\npass_through = false\nmax_entity_depth = 4\n",
        )
        .expect("parse");
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/study")));
        assert!(!config.merge.pass_through);
        assert_eq!(config.merge.max_entity_depth, 4);
        assert!(!config.merge.validate_sort_order);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(StrataConfig::parse("datadir = \"x\"\n").is_err());
    }

    #[test]
    fn data_dir_precedence() {
        let config = StrataConfig {
            data_dir: Some(PathBuf::from("file")),
            ..StrataConfig::default()
        };
        let env = Some(PathBuf::from("env"));
        assert_eq!(
            config.data_dir(Some(Path::new("flag")), env.clone()),
            PathBuf::from("flag")
        );
        assert_eq!(config.data_dir(None, env.clone()), PathBuf::from("file"));
        assert_eq!(
            StrataConfig::default().data_dir(None, env),
            PathBuf::from("env")
        );
        assert_eq!(StrataConfig::default().data_dir(None, None), PathBuf::from("."));
    }

    #[test]
    fn flags_only_tighten_merge_config() {
        let config = StrataConfig::default();
        let merged = config.merge_config(true, true);
        assert!(!merged.pass_through);
        assert!(merged.validate_sort_order);
        assert_eq!(config.merge_config(false, false), MergeConfig::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = StrataConfig::load(Some(&dir.path().join("missing.toml"))).expect_err("missing");
        assert!(matches!(err, MergeError::Configuration(_)));
    }
}
