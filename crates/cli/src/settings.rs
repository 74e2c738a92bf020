use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use vidsquash_core::shared::constants::DEFAULT_VIDEO_BITRATE;

/// Persistent CLI defaults, overridden by command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bitrate")]
    pub bitrate: u64,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_bitrate() -> u64 {
    DEFAULT_VIDEO_BITRATE
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            output_dir: None,
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("vidsquash").join("settings.json"))
    }

    pub fn load() -> Self {
        Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Missing or unparsable files fall back to the defaults.
    pub fn load_from(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }

    pub fn save(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let path = Self::config_path().ok_or("could not determine config directory")?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
