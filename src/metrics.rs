//! Metrics collection for speech sessions
//!
//! Tracks chunk counts and timings for one streaming playback session.
//! Returned with every completed session for diagnostics.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use uuid::Uuid;

/// Metrics for a completed speech session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Unique identifier for this session
    pub session_id: String,
    /// Unix timestamp when the session started (seconds)
    pub started_at: u64,
    /// Audio messages received from the provider
    pub chunks_received: u64,
    /// Chunks that decoded successfully
    pub chunks_decoded: u64,
    /// Chunks dropped because they failed to decode
    pub chunks_dropped: u64,
    /// Chunks that played to the end
    pub chunks_played: u64,
    /// Audio of the chunks counted in `chunks_played`, in milliseconds
    pub audio_played_ms: u64,
    /// Time from session start until the first chunk started playing
    pub time_to_first_audio_ms: Option<u64>,
    /// Total session time in milliseconds
    pub total_ms: u64,
}

/// Internal state for tracking an in-progress session
pub(crate) struct SessionRecorder {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    first_audio: Option<Instant>,
    chunks_received: u64,
    chunks_decoded: u64,
    chunks_dropped: u64,
    chunks_played: u64,
    audio_played_ms: u64,
}

impl SessionRecorder {
    pub(crate) fn new(session_id: Uuid) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        log::debug!("Metrics: starting session {}", session_id);

        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: now,
            first_audio: None,
            chunks_received: 0,
            chunks_decoded: 0,
            chunks_dropped: 0,
            chunks_played: 0,
            audio_played_ms: 0,
        }
    }

    pub(crate) fn chunk_received(&mut self) {
        self.chunks_received += 1;
    }

    pub(crate) fn chunk_decoded(&mut self) {
        self.chunks_decoded += 1;
    }

    pub(crate) fn chunk_dropped(&mut self) {
        self.chunks_dropped += 1;
    }

    /// A chunk was handed to the sink
    pub(crate) fn playback_started(&mut self) {
        if self.first_audio.is_none() {
            self.first_audio = Some(Instant::now());
            log::debug!(
                "Metrics: first audio for session {} after {:?}",
                self.session_id,
                self.started_at.elapsed()
            );
        }
    }

    /// A chunk played to the end; interrupted chunks are not counted
    pub(crate) fn chunk_played(&mut self, duration_ms: u64) {
        self.chunks_played += 1;
        self.audio_played_ms += duration_ms;
    }

    pub(crate) fn finish(&self) -> SessionMetrics {
        let metrics = SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            chunks_received: self.chunks_received,
            chunks_decoded: self.chunks_decoded,
            chunks_dropped: self.chunks_dropped,
            chunks_played: self.chunks_played,
            audio_played_ms: self.audio_played_ms,
            time_to_first_audio_ms: self
                .first_audio
                .map(|t| t.duration_since(self.started_at).as_millis() as u64),
            total_ms: self.started_at.elapsed().as_millis() as u64,
        };

        log::info!(
            "Metrics: session {} - {} chunks played ({}ms audio), {} dropped, total {}ms",
            metrics.session_id,
            metrics.chunks_played,
            metrics.audio_played_ms,
            metrics.chunks_dropped,
            metrics.total_ms
        );

        metrics
    }
}
