//! Configuration for gpuvas

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EmulatorError, Result};

/// Default big page size (128 KiB)
pub const DEFAULT_BIG_PAGE_SIZE: u32 = 0x2_0000;
/// The VA range starts this many big pages into the address space
pub const VA_START_SHIFT: u32 = 10;
/// Default split between the small and big page windows (16 GiB)
pub const DEFAULT_VA_SPLIT: u64 = 1 << 34;
/// Default end of the GPU VA range (128 GiB)
pub const DEFAULT_VA_RANGE: u64 = 1 << 37;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Debug and logging options
    pub debug: DebugConfig,
    /// GPU address space layout
    pub vm: VmConfig,
}

impl Config {
    /// Path of the configuration file
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gpuvas").join("config.toml"))
    }

    /// Load the configuration from disk, falling back to defaults if no file exists
    pub fn load() -> Result<Self> {
        let Some(path) = Self::path() else {
            return Ok(Self::default());
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse a configuration from TOML
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| EmulatorError::Config(e.to_string()))
    }

    /// Write the configuration back to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::path()
            .ok_or_else(|| EmulatorError::Config("No configuration directory".to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| EmulatorError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Debug options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            log_path: PathBuf::from("gpuvas.log"),
        }
    }
}

/// GPU virtual address space layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Size of a big page in bytes, must be a supported power of two
    pub big_page_size: u32,
    /// First usable GPU VA
    pub va_range_start: u64,
    /// Boundary between the small page window and the big page window
    pub va_range_split: u64,
    /// End of the GPU VA range
    pub va_range_end: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            big_page_size: DEFAULT_BIG_PAGE_SIZE,
            va_range_start: (DEFAULT_BIG_PAGE_SIZE as u64) << VA_START_SHIFT,
            va_range_split: DEFAULT_VA_SPLIT,
            va_range_end: DEFAULT_VA_RANGE,
        }
    }
}
