//! Declaration file: retry settings plus the resources to provision.
//!
//! ```toml
//! [retry]
//! max_elapsed_secs = 120
//!
//! [[resource]]
//! name = "audit"
//! parent_identifier = "c1"
//! log_destination_type = "cloudwatch"
//! log_exports = ["connectionlog", "userlog"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use dwprov_engine::{AttrValue, ResourceSpec, RetryConfig};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceBlock>,
}

/// One `[[resource]]` block. Keys other than `name` and `parent_identifier`
/// are resource attributes.
#[derive(Debug, Deserialize)]
pub struct ResourceBlock {
    pub name: String,
    pub parent_identifier: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl From<ResourceBlock> for ResourceSpec {
    fn from(block: ResourceBlock) -> Self {
        ResourceSpec {
            name: block.name,
            parent_identifier: block.parent_identifier,
            attributes: block.attributes,
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Invalid configuration")?;
        config.retry.validate().context("Invalid [retry] table")?;
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn specs(self) -> Vec<ResourceSpec> {
        self.resources.into_iter().map(ResourceSpec::from).collect()
    }
}
