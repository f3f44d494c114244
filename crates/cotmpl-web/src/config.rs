use crate::error::ErrorPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub policy: ErrorPolicy,
    /// Keep a printable listing of each compiled program in its metadata.
    #[serde(default)]
    pub debug_source: bool,
    /// Input-data key holding the declarative property bag.
    #[serde(default = "default_props_key")]
    pub props_key: String,
    #[serde(default = "default_template_script_type")]
    pub template_script_type: String,
    /// Delay used by `##% expr :: "delay" ##`.
    #[serde(default)]
    pub insert_delay_ms: u64,
}

fn default_props_key() -> String {
    "_props".to_string()
}

fn default_template_script_type() -> String {
    "text/co-template".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: ErrorPolicy::default(),
            debug_source: false,
            props_key: default_props_key(),
            template_script_type: default_template_script_type(),
            insert_delay_ms: 0,
        }
    }
}

impl EngineConfig {
    pub fn strict() -> Self {
        Self {
            policy: ErrorPolicy::Strict,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Apply `COTMPL_STRICT` and `COTMPL_DEBUG_SOURCE` when set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(flag) = lookup("COTMPL_STRICT").and_then(|v| parse_flag(&v)) {
            self.policy = if flag {
                ErrorPolicy::Strict
            } else {
                ErrorPolicy::Lenient
            };
        }
        if let Some(flag) = lookup("COTMPL_DEBUG_SOURCE").and_then(|v| parse_flag(&v)) {
            self.debug_source = flag;
        }
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
