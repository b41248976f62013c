//! Streaming synthesis protocol types
//!
//! JSON messages exchanged with the text-to-speech `stream-input` WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://api.elevenlabs.io/v1/text-to-speech/{voice}/stream-input?model_id=...`
//! 2. Send one initiation message carrying text, voice settings, key and model
//! 3. Send the end-of-input marker (`{"text": ""}`) so the provider flushes
//! 4. Receive messages with base64 `audio`, an `error` code, or `isFinal`

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Base address of the streaming synthesis endpoint
pub const STREAM_BASE_URL: &str = "wss://api.elevenlabs.io/v1/text-to-speech";

/// Model used when none is configured
pub const DEFAULT_MODEL_ID: &str = "eleven_multilingual_v2";

/// Raw 16-bit PCM keeps chunk decoding independent of any codec
pub const DEFAULT_OUTPUT_FORMAT: &str = "pcm_24000";

/// Provider error code for abuse/rate detection
pub const UNUSUAL_ACTIVITY_CODE: &str = "detected_unusual_activity";

/// Maps a voice configuration to the streaming endpoint address
pub type UrlBuilder = Arc<dyn Fn(&VoiceConfig) -> String + Send + Sync>;

/// Voice and model selection for one session
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    pub voice_id: String,
    pub model_id: String,
    /// 0.0 - 1.0
    pub stability: f32,
    /// 0.0 - 1.0
    pub similarity_boost: f32,
    /// Provider output format, e.g. `pcm_24000`
    pub output_format: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: crate::voices::DEFAULT_VOICE_ID.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
        }
    }
}

impl VoiceConfig {
    /// Voice settings as sent on the wire, clamped into 0.0 - 1.0
    pub fn voice_settings(&self) -> VoiceSettings {
        VoiceSettings {
            stability: clamp_unit("stability", self.stability),
            similarity_boost: clamp_unit("similarity_boost", self.similarity_boost),
        }
    }
}

fn clamp_unit(name: &str, value: f32) -> f32 {
    if value.is_nan() {
        log::warn!("Voice setting {} is NaN, using 0.5", name);
        return 0.5;
    }
    if !(0.0..=1.0).contains(&value) {
        log::warn!("Voice setting {}={} out of range, clamping", name, value);
    }
    value.clamp(0.0, 1.0)
}

/// Default endpoint address for a voice
pub fn stream_url(voice: &VoiceConfig) -> String {
    format!(
        "{}/{}/stream-input?model_id={}&output_format={}",
        STREAM_BASE_URL, voice.voice_id, voice.model_id, voice.output_format
    )
}

/// Default [`UrlBuilder`] wrapping [`stream_url`]
pub fn default_url_builder() -> UrlBuilder {
    Arc::new(stream_url)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

// ============================================================================
// Client Messages (sent TO the provider)
// ============================================================================

/// Messages sent from client to the streaming endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// Opens the stream: text plus voice configuration and credential
    Initiate {
        text: String,
        voice_settings: VoiceSettings,
        xi_api_key: String,
        model_id: String,
    },
    /// Empty text tells the provider no more input follows
    EndOfInput { text: String },
}

impl ClientMessage {
    /// Create the initiation message for a session
    ///
    /// The provider expects buffered text to end with a space.
    pub fn initiate(text: &str, voice: &VoiceConfig, api_key: &str) -> Self {
        let mut text = text.trim().to_string();
        text.push(' ');

        Self::Initiate {
            text,
            voice_settings: voice.voice_settings(),
            xi_api_key: api_key.to_string(),
            model_id: voice.model_id.clone(),
        }
    }

    pub fn end_of_input() -> Self {
        Self::EndOfInput {
            text: String::new(),
        }
    }
}

// ============================================================================
// Server Messages (received FROM the provider)
// ============================================================================

/// One inbound message; every field is optional on the wire
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerMessage {
    /// Base64-encoded audio chunk
    #[serde(default)]
    pub audio: Option<String>,

    /// Provider error code
    #[serde(default)]
    pub error: Option<String>,

    /// Human-readable detail accompanying `error`
    #[serde(default)]
    pub message: Option<String>,

    /// End of the inbound audio stream
    #[serde(default, rename = "isFinal")]
    pub is_final: Option<bool>,
}

impl ServerMessage {
    /// Parse one inbound text frame
    ///
    /// A frame that does not fit the expected shape but still carries an
    /// `error` field is reported as that error, so the session fails with
    /// the provider's reason instead of running into the watchdog.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let err = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => return Ok(msg),
            Err(e) => e,
        };

        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return Err(err);
        };
        let error = match value.get("error") {
            Some(error) if !error.is_null() => error,
            _ => return Err(err),
        };

        let code = error
            .as_str()
            .or_else(|| error.get("code").and_then(|c| c.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        let message = value
            .get("message")
            .or_else(|| error.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string);

        Ok(Self {
            error: Some(code),
            message,
            ..Default::default()
        })
    }

    /// Error code, if this message reports one
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// Base64 audio payload, if present and non-empty
    pub fn audio_payload(&self) -> Option<&str> {
        self.audio.as_deref().filter(|a| !a.is_empty())
    }

    pub fn is_final(&self) -> bool {
        self.is_final.unwrap_or(false)
    }
}
