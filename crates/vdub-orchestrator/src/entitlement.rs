//! Account entitlements consulted by the stage transitions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Muxed output continues to lip-sync
    #[serde(rename = "lipsync")]
    LipSync,
    /// Muxed output carries no watermark
    WatermarkFree,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LipSync => "lipsync",
            Capability::WatermarkFree => "watermark_free",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lipsync" | "lip_sync" => Ok(Capability::LipSync),
            "watermark_free" | "no_watermark" => Ok(Capability::WatermarkFree),
            other => Err(OrchestratorError::config_error(format!("unknown capability: {other}"))),
        }
    }
}

/// Answers "does this user have capability X".
#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    async fn has_capability(&self, user_id: &str, capability: Capability) -> OrchestratorResult<bool>;
}

/// Fixed grants, typically loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    defaults: HashSet<Capability>,
    grants: HashMap<String, HashSet<Capability>>,
}

impl StaticEntitlements {
    /// No user has any capability.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every user has `capability`.
    pub fn with_default(mut self, capability: Capability) -> Self {
        self.defaults.insert(capability);
        self
    }

    pub fn grant(mut self, user_id: impl Into<String>, capability: Capability) -> Self {
        self.grants.entry(user_id.into()).or_default().insert(capability);
        self
    }

    /// Reads `ENTITLEMENT_DEFAULTS` (capability list) and
    /// `ENTITLEMENT_LIPSYNC_USERS` / `ENTITLEMENT_WATERMARK_FREE_USERS`
    /// (user id lists), all comma separated.
    pub fn from_env() -> OrchestratorResult<Self> {
        let list = |key: &str| -> Vec<String> {
            std::env::var(key)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut entitlements = Self::new();
        for name in list("ENTITLEMENT_DEFAULTS") {
            entitlements = entitlements.with_default(name.parse()?);
        }
        for user in list("ENTITLEMENT_LIPSYNC_USERS") {
            entitlements = entitlements.grant(user, Capability::LipSync);
        }
        for user in list("ENTITLEMENT_WATERMARK_FREE_USERS") {
            entitlements = entitlements.grant(user, Capability::WatermarkFree);
        }
        Ok(entitlements)
    }
}

#[async_trait]
impl EntitlementProvider for StaticEntitlements {
    async fn has_capability(&self, user_id: &str, capability: Capability) -> OrchestratorResult<bool> {
        Ok(self.defaults.contains(&capability)
            || self
                .grants
                .get(user_id)
                .is_some_and(|caps| caps.contains(&capability)))
    }
}
