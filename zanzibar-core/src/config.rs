use crate::error::{Result, ZanzibarError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix, e.g. `ZANZIBAR__CHECK__MAX_DEPTH=25`
pub const ENV_PREFIX: &str = "ZANZIBAR";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub check: CheckConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Maximum nesting of relation evaluations in one check
    pub max_depth: u32,
    /// Maximum children of one set operation evaluated concurrently
    pub max_fanout: usize,
    /// Reuse sub-results within one check call
    pub memoize: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_fanout: 10,
            memoize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Number of most recent revisions kept in the revision log
    pub history_limit: u64,
    /// Events fetched from the log per subscriber wakeup
    pub batch_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
            batch_size: 100,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then an optional config file, then `ZANZIBAR__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.check.validate()?;
        self.watch.validate()
    }
}

fn must_be_positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(ZanzibarError::Configuration(config::ConfigError::Message(
            format!("{field} must be greater than zero"),
        )));
    }
    Ok(())
}

impl CheckConfig {
    pub fn validate(&self) -> Result<()> {
        must_be_positive("check.max_depth", u64::from(self.max_depth))?;
        must_be_positive("check.max_fanout", self.max_fanout as u64)
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        must_be_positive("watch.history_limit", self.history_limit)?;
        must_be_positive("watch.batch_size", self.batch_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.check.max_depth, 50);
        assert_eq!(config.watch.batch_size, 100);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[check]\nmax_depth = 7\nmemoize = false\n\n[watch]\nhistory_limit = 64").unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.check.max_depth, 7);
        assert!(!config.check.memoize);
        assert_eq!(config.check.max_fanout, 10);
        assert_eq!(config.watch.history_limit, 64);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = EngineConfig::default();
        config.check.max_fanout = 0;
        assert!(matches!(
            config.validate(),
            Err(ZanzibarError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[watch]\nbatch_size = 0").unwrap();
        assert!(EngineConfig::load(Some(file.path())).is_err());
    }
}
