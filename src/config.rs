//! Bench configuration loaded from a TOML file.
//!
//! ```toml
//! resources = ["TCPIP0::192.168.0.232::inst0::INSTR"]
//! timeout_ms = 3000
//! identify_timeout_ms = 2000
//! dual_channel_models = ["2342-06 B"]
//!
//! [[display_names]]
//! key = "2342-06"
//! label = "Dual 30V/3A"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::display::{DisplayName, DisplayNames};

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_IDENTIFY_TIMEOUT_MS: u64 = 2000;

/// Model substring of the dual-output unit split into two logical channels.
pub const DEFAULT_DUAL_CHANNEL_MODEL: &str = "2342-06 B";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_identify_timeout_ms")]
    pub identify_timeout_ms: u64,
    #[serde(default = "default_dual_channel_models")]
    pub dual_channel_models: Vec<String>,
    #[serde(default)]
    pub display_names: Vec<DisplayName>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_identify_timeout_ms() -> u64 {
    DEFAULT_IDENTIFY_TIMEOUT_MS
}

fn default_dual_channel_models() -> Vec<String> {
    vec![DEFAULT_DUAL_CHANNEL_MODEL.to_string()]
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            identify_timeout_ms: DEFAULT_IDENTIFY_TIMEOUT_MS,
            dual_channel_models: default_dual_channel_models(),
            display_names: Vec::new(),
        }
    }
}

impl BenchConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid bench configuration")
    }

    /// Missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn display_names(&self) -> DisplayNames {
        DisplayNames::new(self.display_names.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = BenchConfig::from_toml("").unwrap();
        assert_eq!(cfg, BenchConfig::default());
        assert_eq!(cfg.timeout(), Duration::from_secs(3));
        assert_eq!(cfg.dual_channel_models, vec!["2342-06 B".to_string()]);
    }

    #[test]
    fn display_names_keep_file_order() {
        let cfg = BenchConfig::from_toml(
            r#"
            resources = ["TCPIP0::10.0.0.5::inst0::INSTR"]
            timeout_ms = 500

            [[display_names]]
            key = "2342"
            label = "Dual"

            [[display_names]]
            key = "Agilent"
            label = "Single"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.resources.len(), 1);
        assert_eq!(cfg.timeout_ms, 500);
        assert_eq!(cfg.identify_timeout_ms, DEFAULT_IDENTIFY_TIMEOUT_MS);
        assert_eq!(cfg.display_names().lookup("Agilent Technologies,2342-06 B"), Some("Dual"));
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(BenchConfig::from_toml("timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let cfg = BenchConfig::load(Path::new("/nonexistent/bench.toml")).unwrap();
        assert_eq!(cfg, BenchConfig::default());
    }
}
