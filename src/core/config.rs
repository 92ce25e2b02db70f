//! Pass options
//!
//! Options deserialize from TOML with every field optional:
//!
//! ```toml
//! [check]
//! level = 3
//! endian = "detect"   # or "swap"
//! ledger = "chain"    # or "array"
//!
//! [compact]
//! endian = "detect"
//! ```

use crate::error::{CckdError, Result};
use crate::freespace::LedgerFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lowest and highest thoroughness level
pub const MIN_LEVEL: i32 = -1;
pub const MAX_LEVEL: i32 = 4;

/// Thoroughness used when none is given
pub const DEFAULT_LEVEL: i32 = 1;

/// How to treat the byte order the file declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndianAction {
    /// Convert only if the file's order differs from the host's
    #[default]
    Detect,
    /// The caller knows the file needs swapping; convert unconditionally
    Swap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    /// Thoroughness, `-1..=4`
    pub level: i32,
    pub endian: EndianAction,
    /// Encoding used when the ledger is rewritten
    pub ledger: LedgerFormat,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            level: DEFAULT_LEVEL,
            endian: EndianAction::Detect,
            ledger: LedgerFormat::Array,
        }
    }
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn with_endian(mut self, endian: EndianAction) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerFormat) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&self.level) {
            return Err(CckdError::InvalidLevel(self.level));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactOptions {
    pub endian: EndianAction,
}

impl CompactOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endian(mut self, endian: EndianAction) -> Self {
        self.endian = endian;
        self
    }
}

/// Contents of a configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub check: CheckOptions,
    pub compact: CompactOptions,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.check.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = CheckOptions::default();
        assert_eq!(opts.level, 1);
        assert_eq!(opts.endian, EndianAction::Detect);
        assert_eq!(opts.ledger, LedgerFormat::Array);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_level_bounds() {
        assert!(CheckOptions::new().with_level(-1).validate().is_ok());
        assert!(CheckOptions::new().with_level(4).validate().is_ok());
        assert!(matches!(
            CheckOptions::new().with_level(5).validate(),
            Err(CckdError::InvalidLevel(5))
        ));
        assert!(CheckOptions::new().with_level(-2).validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() -> Result<()> {
        let config = Config::from_toml_str(
            r#"
            [check]
            level = 3
            ledger = "chain"
            "#,
        )?;
        assert_eq!(config.check.level, 3);
        assert_eq!(config.check.ledger, LedgerFormat::Chain);
        assert_eq!(config.check.endian, EndianAction::Detect);
        assert_eq!(config.compact, CompactOptions::default());
        Ok(())
    }

    #[test]
    fn test_reject_bad_toml() {
        assert!(matches!(
            Config::from_toml_str("[check]\nlevel = 9\n"),
            Err(CckdError::InvalidLevel(9))
        ));
        assert!(matches!(
            Config::from_toml_str("[check]\nledger = \"linked\"\n"),
            Err(CckdError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cckd.toml");
        std::fs::write(&path, "[compact]\nendian = \"swap\"\n")?;
        let config = Config::from_toml_file(&path)?;
        assert_eq!(config.compact.endian, EndianAction::Swap);
        assert_eq!(config.check, CheckOptions::default());
        Ok(())
    }
}
