// ⚙️ Engine configuration - JSON file + environment
//
// {
//   "database_path": "estimates.db",
//   "default_pricing": { "markup_percent": "10", "vat_percent": "12" },
//   "organizations": { "acme": { "markup_percent": "15", "vat_percent": "12",
//                                "vat_base": "subtotal" } },
//   "server": { "bind": "0.0.0.0:3000" },
//   "logging": { "level": "info", "format": "json" }
// }
//
// Every section is optional. ESTIMATE_DATABASE overrides database_path.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::engine::EstimatingEngine;
use crate::estimate::PricingPolicy;
use crate::logging::LogConfig;

pub const DATABASE_ENV: &str = "ESTIMATE_DATABASE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub default_pricing: PricingPolicy,
    /// Seeded into the store on startup
    pub organizations: BTreeMap<String, PricingPolicy>,
    pub server: ServerConfig,
    pub logging: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from("estimates.db"),
            default_pricing: PricingPolicy::default(),
            organizations: BTreeMap::new(),
            server: ServerConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// File if present, defaults otherwise, then environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            EngineConfig::default()
        };
        config.apply_env(std::env::var(DATABASE_ENV).ok());
        Ok(config)
    }

    fn apply_env(&mut self, database: Option<String>) {
        if let Some(path) = database.filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(reason) = self.default_pricing.validate() {
            bail!("default_pricing: {}", reason);
        }
        for (organization, policy) in &self.organizations {
            if let Err(reason) = policy.validate() {
                bail!("organizations.{}: {}", organization, reason);
            }
        }
        Ok(())
    }

    /// Store every configured organization policy.
    pub fn seed_organizations(&self, engine: &EstimatingEngine) -> Result<usize> {
        for (organization, policy) in &self.organizations {
            engine
                .set_organization_pricing(organization, policy)
                .with_context(|| format!("Failed to store pricing for {}", organization))?;
        }
        if !self.organizations.is_empty() {
            info!(count = self.organizations.len(), "seeded organization pricing");
        }
        Ok(self.organizations.len())
    }
}
