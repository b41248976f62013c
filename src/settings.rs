use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::speech::{PlayerConfig, RetryPolicy, VoiceConfig, DEFAULT_MODEL_ID, DEFAULT_OUTPUT_FORMAT};
use crate::voices::{voice_id_or_default, DEFAULT_VOICE_ID};

const APP_DIR_NAME: &str = "coach-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Provider voice used for feedback.
    pub voice_id: String,

    /// Synthesis model, e.g. `eleven_multilingual_v2`.
    pub model_id: String,

    /// Voice stability, 0.0 - 1.0. Lower values sound more expressive.
    pub stability: f32,

    /// How closely the output should match the original voice, 0.0 - 1.0.
    pub similarity_boost: f32,

    /// Provider output format. Only `pcm_<rate>` formats can be decoded.
    pub output_format: String,

    /// Sessions that have not finished this long after connecting are failed.
    pub watchdog_secs: u64,

    pub connect_timeout_secs: u64,

    /// Connection attempts per request, including the first.
    pub max_attempts: u32,

    /// Base for exponential backoff between connection attempts.
    pub retry_base_delay_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            watchdog_secs: 30,
            connect_timeout_secs: 10,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl AppSettings {
    /// Voice for new sessions; an unusable saved voice falls back to the default
    pub fn voice_config(&self) -> VoiceConfig {
        VoiceConfig {
            voice_id: voice_id_or_default(&self.voice_id),
            model_id: self.model_id.clone(),
            stability: self.stability,
            similarity_boost: self.similarity_boost,
            output_format: self.output_format.clone(),
        }
    }

    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            watchdog: Duration::from_secs(self.watchdog_secs.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts.max(1),
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

/// Read settings from `path`; a missing or corrupt file yields defaults.
pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<PathBuf, String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)?;
    Ok(path)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;

    log::debug!("Settings: saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"voice_id": "TxGEqnHWrfWFTfGW9XjX", "watchdog_secs": 45}"#)
            .unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.voice_id, "TxGEqnHWrfWFTfGW9XjX");
        assert_eq!(settings.watchdog_secs, 45);
        assert_eq!(settings.model_id, DEFAULT_MODEL_ID);
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = AppSettings {
            voice_id: "AZnzlk1XvdvUeBnXmlld".to_string(),
            stability: 0.3,
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_derived_configs() {
        let settings = AppSettings {
            watchdog_secs: 0,
            max_attempts: 0,
            retry_base_delay_ms: 250,
            ..Default::default()
        };

        assert_eq!(settings.player_config().watchdog, Duration::from_secs(1));
        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(settings.voice_config().voice_id, DEFAULT_VOICE_ID);
    }

    #[test]
    fn test_saved_voice_falls_back_to_default() {
        let by_name = AppSettings {
            voice_id: "josh".to_string(),
            ..Default::default()
        };
        assert_eq!(by_name.voice_config().voice_id, "TxGEqnHWrfWFTfGW9XjX");

        let blank = AppSettings {
            voice_id: "  ".to_string(),
            ..Default::default()
        };
        assert_eq!(blank.voice_config().voice_id, DEFAULT_VOICE_ID);
    }
}
