use crate::defaults;
use crate::error::{KaiwaError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Root settings structure, persisted as TOML outside the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub generation: GenerationConfig,
    pub transcription: TranscriptionConfig,
    pub tts: TtsConfig,
    pub persona: PersonaConfig,
}

/// Which completion endpoint serves generation requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendEndpoint {
    Local,
    #[default]
    Remote,
}

/// Text generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub endpoint: BackendEndpoint,
    /// Bearer token for the hosted endpoint. The local endpoint needs none.
    pub api_key: Option<String>,
    pub remote_model: String,
    pub local_model: String,
    pub remote_url: String,
    pub local_url: String,
}

impl GenerationConfig {
    /// URL for the currently selected endpoint.
    pub fn url(&self) -> &str {
        match self.endpoint {
            BackendEndpoint::Local => &self.local_url,
            BackendEndpoint::Remote => &self.remote_url,
        }
    }

    /// Model id for the currently selected endpoint.
    pub fn model(&self) -> &str {
        match self.endpoint {
            BackendEndpoint::Local => &self.local_model,
            BackendEndpoint::Remote => &self.remote_model,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: BackendEndpoint::Remote,
            api_key: None,
            remote_model: defaults::REMOTE_MODEL.to_string(),
            local_model: defaults::LOCAL_MODEL.to_string(),
            remote_url: defaults::REMOTE_COMPLETION_URL.to_string(),
            local_url: defaults::LOCAL_COMPLETION_URL.to_string(),
        }
    }
}

/// Which transcript source variant the session starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionMode {
    /// Cloud bidirectional streaming backend.
    #[default]
    Realtime,
    /// On-device continuous recognition.
    Local,
}

/// Transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub mode: TranscriptionMode,
    pub model: String,
    pub language: String,
    pub realtime_url: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            mode: TranscriptionMode::Realtime,
            model: defaults::TRANSCRIPTION_MODEL.to_string(),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            realtime_url: defaults::REALTIME_URL.to_string(),
        }
    }
}

/// Selectable speech-synthesis provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TtsProviderId {
    /// Hosted edge-TTS streaming endpoint, `{voice, text}` body.
    #[default]
    EdgeStream,
    /// ElevenLabs per-voice endpoint with API-key header.
    ElevenLabs,
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    pub provider: TtsProviderId,
    pub edge_url: String,
    pub edge_voice: String,
    pub elevenlabs_url: String,
    pub elevenlabs_voice_id: String,
    pub elevenlabs_model: String,
    pub elevenlabs_api_key: Option<String>,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProviderId::EdgeStream,
            edge_url: defaults::EDGE_TTS_URL.to_string(),
            edge_voice: defaults::EDGE_TTS_VOICE.to_string(),
            elevenlabs_url: defaults::ELEVENLABS_URL.to_string(),
            elevenlabs_voice_id: defaults::ELEVENLABS_VOICE_ID.to_string(),
            elevenlabs_model: defaults::ELEVENLABS_MODEL.to_string(),
            elevenlabs_api_key: None,
            stability: defaults::ELEVENLABS_STABILITY,
            similarity_boost: defaults::ELEVENLABS_SIMILARITY_BOOST,
        }
    }
}

/// Persona configuration (the fixed system turn).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersonaConfig {
    pub instructions: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            instructions: defaults::DEFAULT_PERSONA.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    ///
    /// Returns an error if the file is missing, contains invalid TOML, or
    /// holds out-of-range values. Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KaiwaError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                KaiwaError::Io(e)
            }
        })?;
        let settings: Settings = toml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a file or return defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(settings) => Ok(settings),
            Err(KaiwaError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Reject values the synthesis providers would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.tts.stability) {
            return Err(KaiwaError::ConfigInvalidValue {
                key: "tts.stability".to_string(),
                message: format!("must be between 0.0 and 1.0, got {}", self.tts.stability),
            });
        }
        if !(0.0..=1.0).contains(&self.tts.similarity_boost) {
            return Err(KaiwaError::ConfigInvalidValue {
                key: "tts.similarity_boost".to_string(),
                message: format!(
                    "must be between 0.0 and 1.0, got {}",
                    self.tts.similarity_boost
                ),
            });
        }
        Ok(())
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - KAIWA_API_KEY → generation.api_key
    /// - KAIWA_ELEVENLABS_API_KEY → tts.elevenlabs_api_key
    /// - KAIWA_LANGUAGE → transcription.language
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("KAIWA_API_KEY")
            && !key.is_empty()
        {
            self.generation.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("KAIWA_ELEVENLABS_API_KEY")
            && !key.is_empty()
        {
            self.tts.elevenlabs_api_key = Some(key);
        }

        if let Ok(language) = std::env::var("KAIWA_LANGUAGE")
            && !language.is_empty()
        {
            self.transcription.language = language;
        }

        self
    }

    /// Get the default settings file path.
    ///
    /// Returns ~/.config/kaiwa/config.toml on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("kaiwa")
            .join("config.toml")
    }

    /// Wrap these settings in a shared, mutable handle.
    pub fn into_handle(self) -> SettingsHandle {
        SettingsHandle::new(self)
    }
}

/// Shared settings handle injected into the session.
///
/// Writers (preferences UI, CLI flags) update it; readers take a snapshot at
/// the moment an operation starts, so a provider or backend switch applies to
/// the next operation even while an earlier one is still in flight.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Snapshot of the current settings.
    pub fn snapshot(&self) -> Settings {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mutate the settings in place.
    pub fn update<F: FnOnce(&mut Settings)>(&self, f: F) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.generation.endpoint, BackendEndpoint::Remote);
        assert_eq!(settings.transcription.mode, TranscriptionMode::Realtime);
        assert_eq!(settings.tts.provider, TtsProviderId::EdgeStream);
        assert!(settings.generation.api_key.is_none());
        assert!(!settings.persona.instructions.is_empty());
    }

    #[test]
    fn test_generation_url_follows_endpoint() {
        let mut config = GenerationConfig::default();
        assert_eq!(config.url(), defaults::REMOTE_COMPLETION_URL);
        assert_eq!(config.model(), defaults::REMOTE_MODEL);

        config.endpoint = BackendEndpoint::Local;
        assert_eq!(config.url(), defaults::LOCAL_COMPLETION_URL);
        assert_eq!(config.model(), defaults::LOCAL_MODEL);
    }

    #[test]
    fn test_load_partial_toml_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[transcription]\nmode = \"local\"\nlanguage = \"ms\"\n"
        )
        .expect("write");

        let settings = Settings::load(file.path()).expect("load");
        assert_eq!(settings.transcription.mode, TranscriptionMode::Local);
        assert_eq!(settings.transcription.language, "ms");
        // Untouched sections fall back to defaults
        assert_eq!(settings.generation.endpoint, BackendEndpoint::Remote);
        assert_eq!(settings.tts.provider, TtsProviderId::EdgeStream);
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "not valid toml [[[").expect("write");

        assert!(Settings::load(file.path()).is_err());
        assert!(Settings::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_stability() {
        let mut settings = Settings::default();
        settings.tts.stability = 1.5;
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err,
            KaiwaError::ConfigInvalidValue { key, .. } if key == "tts.stability"
        ));

        let mut settings = Settings::default();
        settings.tts.similarity_boost = -0.1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_names_the_path() {
        let err = Settings::load(Path::new("/nonexistent/kaiwa/config.toml")).unwrap_err();
        assert!(matches!(err, KaiwaError::ConfigFileNotFound { .. }));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let settings =
            Settings::load_or_default(Path::new("/nonexistent/kaiwa/config.toml")).expect("defaults");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_provider_roundtrip_snake_case() {
        let settings = Settings {
            tts: TtsConfig {
                provider: TtsProviderId::ElevenLabs,
                ..Default::default()
            },
            ..Default::default()
        };
        let toml_str = toml::to_string(&settings).expect("serialize");
        assert!(toml_str.contains("eleven_labs"), "got: {}", toml_str);
        let parsed: Settings = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.tts.provider, TtsProviderId::ElevenLabs);
    }

    #[test]
    fn test_settings_handle_snapshot_sees_updates() {
        let handle = Settings::default().into_handle();
        assert_eq!(handle.snapshot().tts.provider, TtsProviderId::EdgeStream);

        handle.update(|s| s.tts.provider = TtsProviderId::ElevenLabs);
        assert_eq!(handle.snapshot().tts.provider, TtsProviderId::ElevenLabs);
    }

    #[test]
    fn test_settings_handle_snapshot_is_detached() {
        let handle = Settings::default().into_handle();
        let before = handle.snapshot();
        handle.update(|s| s.transcription.language = "ms".to_string());
        // The earlier snapshot is unaffected by later updates
        assert_eq!(before.transcription.language, "en");
        assert_eq!(handle.snapshot().transcription.language, "ms");
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Settings::default_path();
        assert!(path.ends_with("kaiwa/config.toml"));
    }
}
