//! Process configuration.
//!
//! Settings come from defaults, an optional TOML file and the environment.
//! Progress reporting can also be switched on for the whole process with
//! [`set_progress_global`].

use crate::core::error::{ConfigError, ImageError, ImageResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Default size above which large loads go via a disc file: 100 MiB.
pub const DEFAULT_DISC_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Default strip height used when a sink walks its output.
pub const DEFAULT_TILE_HEIGHT: u32 = 16;

/// Environment variables that switch progress reporting on.
pub const PROGRESS_ENV: [&str; 2] = ["RASTERKIT_PROGRESS", "IM_PROGRESS"];

/// Environment variable overriding the disc threshold.
pub const DISC_THRESHOLD_ENV: &str = "RASTERKIT_DISC_THRESHOLD";

static PROGRESS: AtomicBool = AtomicBool::new(false);

/// Switch progress reporting on or off for every registry in the process.
pub fn set_progress_global(progress: bool) {
    PROGRESS.store(progress, Ordering::Relaxed);
}

/// Whether progress reporting was switched on process-wide.
pub fn progress_global() -> bool {
    PROGRESS.load(Ordering::Relaxed)
}

/// Configuration shared by every image of one registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Attach the logging progress reporter to new write targets.
    pub progress: bool,
    /// Loads bigger than this many bytes decode via a temporary disc file.
    pub disc_threshold: u64,
    /// Height of the strips a sink computes at once.
    pub tile_height: u32,
    /// Compute strips of memory targets in parallel.
    pub parallel: bool,
    /// Where temporary files go. `None` uses the system default.
    pub temp_dir: Option<PathBuf>,
    /// Let write-prepare turn an unattached lazy image into a memory image.
    pub lazy_write_fallback: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            progress: false,
            disc_threshold: DEFAULT_DISC_THRESHOLD,
            tile_height: DEFAULT_TILE_HEIGHT,
            parallel: true,
            temp_dir: None,
            lazy_write_fallback: true,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the environment.
    ///
    /// A malformed threshold is logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if PROGRESS_ENV.iter().any(|name| std::env::var_os(name).is_some()) {
            config.progress = true;
        }

        if let Ok(value) = std::env::var(DISC_THRESHOLD_ENV) {
            match parse_size(&value) {
                Ok(size) => config.disc_threshold = size,
                Err(e) => warn!("ignoring {}: {}", DISC_THRESHOLD_ENV, e),
            }
        }

        config
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> ImageResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(ImageError::io_with(format!("read config \"{}\"", path.display())))?;
        Ok(Self::from_toml_str(&text)?)
    }

    /// Whether progress reporting is on, here or process-wide.
    pub fn progress_enabled(&self) -> bool {
        self.progress || progress_global()
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_disc_threshold(mut self, bytes: u64) -> Self {
        self.disc_threshold = bytes;
        self
    }

    /// Set the sink strip height. Zero is treated as one line.
    pub fn with_tile_height(mut self, lines: u32) -> Self {
        self.tile_height = lines.max(1);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_lazy_write_fallback(mut self, fallback: bool) -> Self {
        self.lazy_write_fallback = fallback;
        self
    }

    /// Directory for temporary files.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Parse a size such as `"512"`, `"64k"` or `"1G"`.
///
/// Suffixes are binary multiples and case-insensitive.
pub fn parse_size(value: &str) -> Result<u64, ConfigError> {
    let bad = || ConfigError::BadSize {
        value: value.to_string(),
    };

    let text = value.trim();
    let (digits, shift) = match text.chars().last() {
        Some('k') | Some('K') => (&text[..text.len() - 1], 10),
        Some('m') | Some('M') => (&text[..text.len() - 1], 20),
        Some('g') | Some('G') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };

    let number: u64 = digits.trim().parse().map_err(|_| bad())?;
    number.checked_mul(1u64 << shift).ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("100m").unwrap(), DEFAULT_DISC_THRESHOLD);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size(" 3 K ").unwrap(), 3 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("12q").is_err());
        assert!(parse_size("-5k").is_err());
        assert!(parse_size("99999999999999g").is_err());
    }

    #[test]
    fn test_toml_keeps_defaults() {
        let config = CoreConfig::from_toml_str("tile_height = 4\nprogress = true\n").unwrap();
        assert_eq!(config.tile_height, 4);
        assert!(config.progress);
        assert_eq!(config.disc_threshold, DEFAULT_DISC_THRESHOLD);
        assert!(config.lazy_write_fallback);

        assert!(CoreConfig::from_toml_str("tile_height = \"tall\"").is_err());
    }

    #[test]
    fn test_builder() {
        let config = CoreConfig::new()
            .with_parallel(false)
            .with_tile_height(0)
            .with_disc_threshold(1024);
        assert!(!config.parallel);
        assert_eq!(config.tile_height, 1);
        assert_eq!(config.disc_threshold, 1024);
    }
}
