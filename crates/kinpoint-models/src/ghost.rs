use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Where an active ghost-mode flag comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GhostScope {
    Global,
    Family,
    None,
}

/// Effective ghost-mode answer for a `(user, family)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhostStatus {
    pub enabled: bool,
    pub scope: GhostScope,
}

impl GhostStatus {
    pub const VISIBLE: Self = Self {
        enabled: false,
        scope: GhostScope::None,
    };

    pub fn global() -> Self {
        Self {
            enabled: true,
            scope: GhostScope::Global,
        }
    }

    pub fn family() -> Self {
        Self {
            enabled: true,
            scope: GhostScope::Family,
        }
    }
}

/// Full ghost-mode state for one user: the global flag plus per-family
/// overrides. A user is hidden from family `f` when `global` is true or
/// `per_family[f]` is true.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GhostModes {
    pub global: bool,
    #[serde(default)]
    pub per_family: HashMap<String, bool>,
}

impl GhostModes {
    pub fn effective(&self, family_id: &str) -> bool {
        self.global || self.per_family.get(family_id).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_is_global_or_per_family() {
        let mut modes = GhostModes::default();
        assert!(!modes.effective("fA"));

        modes.per_family.insert("fA".into(), true);
        assert!(modes.effective("fA"));
        assert!(!modes.effective("fB"));

        modes.global = true;
        assert!(modes.effective("fB"));
    }
}
