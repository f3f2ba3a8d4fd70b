//! Configuration loaded from `kiln.toml` with `KILN_*` environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub codegen: CodegenConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Assembler switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodegenConfig {
    /// Keep values in SSA registers; when false every value is spilled to a
    /// function-scope slot and reloaded at each use
    #[serde(default = "default_true")]
    pub optimize_load_store: bool,

    /// Funnel void returns through one shared return block
    #[serde(default)]
    pub return_label: bool,

    /// Emit `OpName` for functions, parameters, slots and labels
    #[serde(default = "default_true")]
    pub debug_names: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            optimize_load_store: true,
            return_label: false,
            debug_names: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Event slots per (plan, device)
    #[serde(default = "default_event_window")]
    pub event_window: usize,

    /// Wrap the event cursor instead of failing at the end of the window
    #[serde(default = "default_true")]
    pub circular_events: bool,

    /// Write each binary to `staging_dir` before installing it
    #[serde(default)]
    pub stage_to_disk: bool,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_window: default_event_window(),
            circular_events: true,
            stage_to_disk: false,
            staging_dir: default_staging_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_event_window() -> usize {
    1024
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("kiln-spirv")
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("invalid configuration: {}", e))
    }

    /// Read a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let mut config = Self::parse(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `KILN_*` overrides from `lookup`; unparsable values are ignored
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |key: &str| lookup(key).and_then(|v| parse_flag(&v));

        if let Some(v) = flag("KILN_OPTIMIZE_LOAD_STORE") {
            self.codegen.optimize_load_store = v;
        }
        if let Some(v) = flag("KILN_RETURN_LABEL") {
            self.codegen.return_label = v;
        }
        if let Some(v) = flag("KILN_DEBUG_NAMES") {
            self.codegen.debug_names = v;
        }
        if let Some(v) = lookup("KILN_EVENT_WINDOW").and_then(|v| v.parse().ok()) {
            self.runtime.event_window = v;
        }
        if let Some(v) = flag("KILN_CIRCULAR_EVENTS") {
            self.runtime.circular_events = v;
        }
        if let Some(v) = flag("KILN_STAGE_TO_DISK") {
            self.runtime.stage_to_disk = v;
        }
        if let Some(v) = lookup("KILN_STAGING_DIR") {
            self.runtime.staging_dir = PathBuf::from(v);
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
