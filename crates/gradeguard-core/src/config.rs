//! Workflow configuration.
//!
//! Loaded from a JSON file named by `GRADEGUARD_CONFIG`; defaults apply
//! when the variable is unset.
//!
//! ```json
//! {
//!   "moderation_required_default": true,
//!   "default_chain": ["teacher_submitted", "hod_review", "admin_approval", "principal_approval"],
//!   "tenant_chains": { "school-b": ["teacher_submitted", "principal_approval"] }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use gradeguard_state::{ModerationStage, TenantId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{GradeGuardError, Result};
use crate::moderation::validate_chain;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "GRADEGUARD_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradeGuardConfig {
    /// `moderation_required` for cycles created without an explicit value.
    pub moderation_required_default: bool,
    /// Chain used by tenants without an entry in `tenant_chains`.
    pub default_chain: Vec<ModerationStage>,
    pub tenant_chains: HashMap<TenantId, Vec<ModerationStage>>,
}

impl Default for GradeGuardConfig {
    fn default() -> Self {
        Self {
            moderation_required_default: true,
            default_chain: ModerationStage::DEFAULT_CHAIN.to_vec(),
            tenant_chains: HashMap::new(),
        }
    }
}

impl GradeGuardConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GradeGuardError::InvalidConfig(format!("config is not valid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GradeGuardError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Load from the file named by `GRADEGUARD_CONFIG`, or fall back to defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let config = Self::load(&path)?;
                info!(path = %path, tenants = config.tenant_chains.len(), "loaded gradeguard config");
                Ok(config)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_chain(&self.default_chain)?;
        for (tenant, chain) in &self.tenant_chains {
            validate_chain(chain).map_err(|e| match e {
                GradeGuardError::InvalidConfig(msg) => {
                    GradeGuardError::InvalidConfig(format!("tenant {tenant}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// The chain a moderation submitted by `tenant` will be frozen with.
    pub fn resolve_chain(&self, tenant: &TenantId) -> &[ModerationStage] {
        self.tenant_chains
            .get(tenant)
            .unwrap_or(&self.default_chain)
    }

    pub fn with_tenant_chain(mut self, tenant: TenantId, chain: Vec<ModerationStage>) -> Self {
        self.tenant_chains.insert(tenant, chain);
        self
    }
}
