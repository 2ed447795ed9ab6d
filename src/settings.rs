use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::capture::DEFAULT_BATCH_BLOCKS;
use crate::audio::meter::{DEFAULT_VAD_THRESHOLD, DEFAULT_VOLUME_INTERVAL_MS};
use crate::audio::playback::DEFAULT_PLAYBACK_RATE;
use crate::live::protocol::{
    GenerationConfig, SpeechConfig, SystemInstruction, DEFAULT_MODEL, LIVE_API_URL,
};
use crate::live::{SessionConfig, SessionOptions};

const APP_DIR_NAME: &str = "live-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Live service endpoint (credential is appended as `?key=`).
    pub ws_url: String,

    pub model: String,

    /// Prebuilt voice used for audio responses.
    pub voice_name: String,

    pub temperature: f32,
    pub max_output_tokens: u32,

    /// Sent as the session's system instruction; empty disables it.
    pub system_instruction: String,

    /// Speed multiplier for response playback.
    pub playback_rate: f32,

    /// Quiet period after the last inbound audio chunk before it is played.
    pub debounce_ms: u64,

    /// Silence after voice activity stops before the turn moves on.
    pub silence_ms: u64,

    /// Handshake window for `setupComplete`.
    pub connect_timeout_secs: u64,

    /// Microphone blocks batched into one uploaded frame.
    pub capture_batch_blocks: usize,

    pub volume_interval_ms: u64,

    /// Input volume above which the user counts as speaking.
    pub vad_threshold: f32,

    /// Sample rate response audio is played at.
    pub response_sample_rate: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let generation = GenerationConfig::default();
        Self {
            ws_url: LIVE_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: "Aoede".to_string(),
            temperature: generation.temperature.unwrap_or(0.4),
            max_output_tokens: generation.max_output_tokens.unwrap_or(1024),
            system_instruction: SessionConfig::default()
                .system_instruction
                .and_then(|si| si.parts.first().and_then(|p| p.as_text().map(str::to_string)))
                .unwrap_or_default(),
            playback_rate: DEFAULT_PLAYBACK_RATE,
            debounce_ms: 500,
            silence_ms: 300,
            connect_timeout_secs: 10,
            capture_batch_blocks: DEFAULT_BATCH_BLOCKS,
            volume_interval_ms: DEFAULT_VOLUME_INTERVAL_MS,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            response_sample_rate: 16000,
        }
    }
}

impl ClientSettings {
    /// Setup payload for a new session
    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                speech_config: Some(SpeechConfig::prebuilt_voice(&self.voice_name)),
                temperature: Some(self.temperature),
                max_output_tokens: Some(self.max_output_tokens),
                ..GenerationConfig::default()
            }),
            system_instruction: if self.system_instruction.trim().is_empty() {
                None
            } else {
                Some(SystemInstruction::from_text(&self.system_instruction))
            },
            tools: defaults.tools,
        }
    }

    /// Session loop tuning; `api_key` is the resolved credential, if any
    pub fn session_options(&self, api_key: Option<String>) -> SessionOptions {
        SessionOptions {
            ws_url: self.ws_url.clone(),
            api_key,
            debounce: Duration::from_millis(self.debounce_ms),
            silence: Duration::from_millis(self.silence_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            response_sample_rate: self.response_sample_rate,
            playback_rate: self.playback_rate,
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, writing a default file on first run so it can be edited
pub fn load_or_create_settings() -> ClientSettings {
    match settings_path() {
        Ok(path) => load_or_create_settings_at(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ClientSettings::default()
        }
    }
}

pub fn load_or_create_settings_at(path: &Path) -> ClientSettings {
    if path.exists() {
        return load_settings_from(path);
    }

    let settings = ClientSettings::default();
    match save_settings_to(path, &settings) {
        Ok(()) => log::info!("Settings: wrote defaults to {:?}", path),
        Err(e) => log::warn!("Settings: {}", e),
    }
    settings
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<(), String> {
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

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));

        assert_eq!(settings, ClientSettings::default());
        assert_eq!(settings.debounce_ms, 500);
        assert_eq!(settings.silence_ms, 300);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert!((settings.playback_rate - 1.42).abs() < 1e-6);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = ClientSettings {
            voice_name: "Puck".to_string(),
            playback_rate: 1.0,
            ..ClientSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-voice").join("settings.json");

        let settings = load_or_create_settings_at(&path);

        assert_eq!(settings, ClientSettings::default());
        assert!(path.exists());
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"voice_name": "Charon"}"#).unwrap();

        let settings = load_or_create_settings_at(&path);

        assert_eq!(settings.voice_name, "Charon");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"voice_name": "Charon"}"#
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"debounce_ms": 250}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.debounce_ms, 250);
        assert_eq!(settings.silence_ms, 300);
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(load_settings_from(&path), ClientSettings::default());
    }

    #[test]
    fn test_session_config_from_settings() {
        let settings = ClientSettings {
            voice_name: "Kore".to_string(),
            system_instruction: String::new(),
            ..ClientSettings::default()
        };
        let config = settings.session_config();

        assert_eq!(config.model, DEFAULT_MODEL);
        assert!(config.system_instruction.is_none());
        let generation = config.generation_config.unwrap();
        assert_eq!(
            generation
                .speech_config
                .unwrap()
                .voice_config
                .prebuilt_voice_config
                .voice_name,
            "Kore"
        );
        assert_eq!(generation.max_output_tokens, Some(1024));
    }

    #[test]
    fn test_session_options_from_settings() {
        let options = ClientSettings::default().session_options(Some("k".to_string()));

        assert_eq!(options.debounce, Duration::from_millis(500));
        assert_eq!(options.silence, Duration::from_millis(300));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.response_sample_rate, 16000);
        assert_eq!(options.api_key.as_deref(), Some("k"));
    }
}
