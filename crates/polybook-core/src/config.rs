//! Toolchain configuration.
//!
//! Every setting is a plain executable name or path. Nothing here is
//! validated up front; a wrong path surfaces as a spawn failure when the
//! tool is first used.
//!
//! ```text
//! --config <file>  >  $POLYBOOK_CONFIG  >  <config dir>/polybook/config.json  >  defaults
//! ```
//!
//! `$POLYBOOK_PYTHON`, when set, overrides the interpreter from any source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::language::Language;

const CONFIG_ENV: &str = "POLYBOOK_CONFIG";
const PYTHON_ENV: &str = "POLYBOOK_PYTHON";

/// Default time allowed for the interpreter to announce readiness.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5_000;

/// Executable lookups for every supported toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Python interpreter for persistent sessions.
    pub python: String,
    /// C compiler.
    pub gcc: String,
    /// C++ compiler.
    pub gpp: String,
    /// Java compiler.
    pub javac: String,
    /// Java launcher.
    pub java: String,
    /// JavaScript runtime.
    pub node: String,
    /// Interpreter readiness bound in milliseconds.
    pub startup_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            python: default_python(),
            gcc: "gcc".to_string(),
            gpp: "g++".to_string(),
            javac: "javac".to_string(),
            java: "java".to_string(),
            node: "node".to_string(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
        }
    }
}

fn default_python() -> String {
    if which::which("python3").is_ok() {
        "python3".to_string()
    } else {
        "python".to_string()
    }
}

impl Config {
    /// Load configuration, preferring an explicit file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| Self::default_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// `<config dir>/polybook/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("polybook").join("config.json"))
    }

    fn apply_env(&mut self) {
        if let Ok(python) = std::env::var(PYTHON_ENV)
            && !python.trim().is_empty()
        {
            self.python = python;
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Compiler for a language, if it has a compile step.
    pub fn compiler(&self, language: Language) -> Option<&str> {
        match language {
            Language::C => Some(&self.gcc),
            Language::Cpp => Some(&self.gpp),
            Language::Java => Some(&self.javac),
            Language::Python | Language::JavaScript => None,
        }
    }
}
