// Engine configuration: device period hint, extra latency budget, optional
// sink/source names. Stored as JSON in <config_dir>/softkvm/config.json and
// immutable once the engine is constructed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Requested device period in frames. A hint only — the audio server may
/// pick something else, and the pipeline adapts either way.
pub const DEFAULT_PERIOD_SIZE: u32 = 1024;

/// Extra jitter budget added on top of the device period when computing the
/// target latency, in milliseconds.
pub const DEFAULT_BUFFER_LATENCY_MS: u32 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Requested device period size in frames.
    pub period_size: u32,
    /// Additional buffer latency in milliseconds.
    pub buffer_latency_ms: u32,
    /// Playback sink name passed to the audio server (None = default).
    pub sink: Option<String>,
    /// Capture source name passed to the audio server (None = default).
    pub source: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            period_size: DEFAULT_PERIOD_SIZE,
            buffer_latency_ms: DEFAULT_BUFFER_LATENCY_MS,
            sink: None,
            source: None,
        }
    }
}

impl Config {
    /// Path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Load config from disk, or return defaults if not found / invalid.
    pub fn load() -> Self {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Invalid config, using defaults: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Cannot read config: {e}");
                Self::default()
            }
        }
    }

    /// Save config to disk.
    pub fn save(&self) {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return,
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("Cannot save config: {e}");
                }
            }
            Err(e) => log::warn!("Cannot serialize config: {e}"),
        }
    }
}

/// Get the application config directory.
fn config_dir() -> Option<PathBuf> {
    // macOS:   ~/Library/Application Support/softkvm/
    // Linux:   ~/.config/softkvm/
    // Windows: %APPDATA%/softkvm/

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").ok()?;
        Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("softkvm"),
        )
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").ok()?;
        Some(PathBuf::from(appdata).join("softkvm"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".config").join("softkvm"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_partial_json() {
        let config: Config = serde_json::from_str(r#"{ "period_size": 512 }"#).unwrap();
        assert_eq!(config.period_size, 512);
        assert_eq!(config.buffer_latency_ms, DEFAULT_BUFFER_LATENCY_MS);
        assert!(config.sink.is_none());
    }

    #[test]
    fn round_trip() {
        let mut config = Config::default();
        config.sink = Some("alsa_output.hdmi".into());
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sink.as_deref(), Some("alsa_output.hdmi"));
        assert_eq!(back.period_size, config.period_size);
    }
}
