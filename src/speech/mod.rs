//! Streaming text-to-speech playback
//!
//! Speaks a piece of feedback text through a remote streaming synthesis
//! endpoint, playing audio chunks back-to-back as they arrive.
//!
//! # Architecture
//!
//! ```text
//!  SpeakRequest ──▶ StreamingAudioPlayer ──▶ Transport (WebSocket)
//!                        │     ▲                   │
//!                        │     └── ServerMessage ◀─┘
//!                        ▼
//!                  reduce(State, Event) ──▶ Effects
//!                        │
//!          ┌─────────────┼──────────────┐
//!          ▼             ▼              ▼
//!    ChunkDecoder    AudioSink     PlaybackEvent
//!   (blocking pool)  (one at a time)  (caller)
//! ```
//!
//! # Failure Strategy
//!
//! - A chunk that fails to decode is dropped, the session continues
//! - Provider errors, abnormal closure and the watchdog end the session
//! - Handshake failures are retried with exponential backoff by
//!   [`speak_with_retry`]; nothing else is retried

mod decoder;
mod player;
mod protocol;
mod retry;
mod session;
mod transport;

pub use decoder::{decode_payload, AudioChunk, ChunkDecoder, DecodeError, FormatDecoder};
pub use player::{
    PlaybackEvent, PlaybackHandle, PlayerConfig, SessionOutcome, SpeakRequest,
    StreamingAudioPlayer,
};
pub use protocol::{
    default_url_builder, stream_url, ClientMessage, ServerMessage, UrlBuilder, VoiceConfig,
    VoiceSettings, DEFAULT_MODEL_ID, DEFAULT_OUTPUT_FORMAT, STREAM_BASE_URL,
    UNUSUAL_ACTIVITY_CODE,
};
pub use retry::{speak_with_retry, RetryPolicy};
pub use session::{reduce, Effect, Event, Playback, State};
pub use transport::{Connector, Transport, TransportEvent, WebSocketConnector};

use std::time::Duration;

/// Coarse category of a [`SpeechError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingCredentials,
    ConnectionError,
    DecodeError,
    ProviderRejected,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingCredentials => "missing_credentials",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::ProviderRejected => "provider_rejected",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// Errors that can end a speech session
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechError {
    /// Text or API key absent; no connection was attempted
    MissingCredentials(String),
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Connection dropped or errored mid-session
    Disconnected(String),
    /// The provider sent an explicit error code
    Provider { code: String },
    /// A single chunk could not be decoded (never terminal)
    Decode(String),
    /// The watchdog closed the session
    Timeout(Duration),
}

impl SpeechError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpeechError::MissingCredentials(_) => ErrorKind::MissingCredentials,
            SpeechError::ConnectionFailed(_) | SpeechError::Disconnected(_) => {
                ErrorKind::ConnectionError
            }
            SpeechError::Provider { .. } => ErrorKind::ProviderRejected,
            SpeechError::Decode(_) => ErrorKind::DecodeError,
            SpeechError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Only failures to connect are worth a fresh session
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpeechError::ConnectionFailed(_))
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Provider error code, if the provider rejected the session
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            SpeechError::Provider { code } => Some(code),
            _ => None,
        }
    }
}

impl std::fmt::Display for SpeechError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeechError::MissingCredentials(e) => {
                write!(
                    f,
                    "Missing text or API key ({}). Set ELEVENLABS_API_KEY or run `coach-voice set-key`.",
                    e
                )
            }
            SpeechError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to the voice service: {}", e)
            }
            SpeechError::Disconnected(e) => {
                write!(f, "Voice service connection lost: {}", e)
            }
            SpeechError::Provider { code } if code == UNUSUAL_ACTIVITY_CODE => {
                write!(
                    f,
                    "The voice service detected unusual activity on this API key. \
                     Please check your account or try again later."
                )
            }
            SpeechError::Provider { code } => write!(f, "{}", code),
            SpeechError::Decode(e) => write!(f, "Failed to decode audio chunk: {}", e),
            SpeechError::Timeout(after) => {
                write!(f, "Voice playback timed out after {}s", after.as_secs())
            }
        }
    }
}

impl std::error::Error for SpeechError {}
