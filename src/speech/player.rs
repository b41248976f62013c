//! Streaming audio player
//!
//! Drives one speech session: executes the effects returned by
//! [`reduce`](super::reduce) against the transport, the decoder pool and the
//! audio sink, and feeds everything that happens back in as events.
//!
//! # Event Loop
//!
//! ```text
//!   cancel ─┐
//!   connect ┤
//!   recv ───┼──▶ Wake ──▶ Event ──▶ reduce ──▶ Effects ──▶ execute
//!   decode ─┤                          ▲                      │
//!   play ───┤                          └──── follow-up ───────┘
//!   watchdog┘
//! ```
//!
//! Everything runs on one task; the queue is never shared. The audio sink is
//! shared between sessions, so every call to it carries the session id.

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::decoder::{decode_payload, AudioChunk, ChunkDecoder};
use super::protocol::{default_url_builder, ClientMessage, UrlBuilder, VoiceConfig};
use super::retry::{speak_with_retry, RetryPolicy};
use super::session::{reduce, Effect, Event, State};
use super::transport::{Connector, Transport, TransportEvent};
use super::SpeechError;
use crate::audio::{AudioError, AudioSink};
use crate::metrics::{SessionMetrics, SessionRecorder};

/// Default hard limit on a session, counted from connection open
const DEFAULT_WATCHDOG: Duration = Duration::from_secs(30);

/// Default timeout for establishing the connection
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Transport>, SpeechError>> + Send>>;
type DecodeFuture = Pin<Box<dyn Future<Output = (u64, Result<AudioChunk, String>)> + Send>>;
type PlayFuture = Pin<Box<dyn Future<Output = Played> + Send>>;

/// A chunk handed to the sink came back
struct Played {
    sequence: u64,
    duration_ms: u64,
    result: Result<(), AudioError>,
}

/// What to speak and with which voice
#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub text: String,
    /// Resolved provider credential
    pub api_key: Option<String>,
    pub voice: VoiceConfig,
}

impl SpeakRequest {
    pub fn new(text: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            text: text.into(),
            api_key,
            voice: VoiceConfig::default(),
        }
    }

    pub fn with_voice(mut self, voice: VoiceConfig) -> Self {
        self.voice = voice;
        self
    }

    fn text(&self) -> Option<&str> {
        Some(self.text.trim()).filter(|t| !t.is_empty())
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// Player tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerConfig {
    /// Session fails with a timeout this long after the connection opens
    pub watchdog: Duration,
    pub connect_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            watchdog: DEFAULT_WATCHDOG,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Notifications for the caller while a session runs
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    SpeakingChanged { session_id: Uuid, speaking: bool },
    /// The request failed; emitted once, after all retries
    Failed(SpeechError),
    /// The request completed and everything was played
    Finished,
}

/// How a session ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(SessionMetrics),
    Cancelled,
}

/// Text-to-speech player over a streaming synthesis connection
#[derive(Clone)]
pub struct StreamingAudioPlayer {
    connector: Arc<dyn Connector>,
    decoder: Arc<dyn ChunkDecoder>,
    sink: Arc<dyn AudioSink>,
    url_builder: UrlBuilder,
    config: PlayerConfig,
}

impl StreamingAudioPlayer {
    pub fn new(
        connector: Arc<dyn Connector>,
        decoder: Arc<dyn ChunkDecoder>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            connector,
            decoder,
            sink,
            url_builder: default_url_builder(),
            config: PlayerConfig::default(),
        }
    }

    pub fn with_url_builder(mut self, url_builder: UrlBuilder) -> Self {
        self.url_builder = url_builder;
        self
    }

    pub fn with_config(mut self, config: PlayerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Start speaking in the background
    pub fn start(&self, request: SpeakRequest) -> PlaybackHandle {
        self.launch(request, None)
    }

    /// Start speaking in the background, retrying failed connections
    pub fn start_with_retry(&self, request: SpeakRequest, policy: RetryPolicy) -> PlaybackHandle {
        self.launch(request, Some(policy))
    }

    fn launch(&self, request: SpeakRequest, policy: Option<RetryPolicy>) -> PlaybackHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let player = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = match policy {
                Some(policy) => speak_with_retry(&player, &request, &policy, &events_tx, &token).await,
                None => player.speak(&request, &events_tx, &token).await,
            };

            match &result {
                Ok(SessionOutcome::Completed(_)) => {
                    let _ = events_tx.send(PlaybackEvent::Finished);
                }
                Ok(SessionOutcome::Cancelled) => {}
                Err(e) => {
                    let _ = events_tx.send(PlaybackEvent::Failed(e.clone()));
                }
            }
            result
        });

        PlaybackHandle {
            events: events_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Run a single session to completion
    ///
    /// Emits `SpeakingChanged` events only; terminal events are left to the
    /// caller so retries do not report intermediate failures.
    pub async fn speak(
        &self,
        request: &SpeakRequest,
        events: &mpsc::UnboundedSender<PlaybackEvent>,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, SpeechError> {
        let mut session = Session::new(self, request, events);
        session.run(cancel).await
    }
}

/// Caller side of a background session
///
/// Dropping the handle cancels the session.
pub struct PlaybackHandle {
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<SessionOutcome, SpeechError>>>,
}

impl PlaybackHandle {
    /// Next playback event; `None` once the session has ended and all
    /// events were consumed
    pub async fn next_event(&mut self) -> Option<PlaybackEvent> {
        self.events.recv().await
    }

    /// Stop playback and close the connection. Never reported as a failure.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the session to end
    pub async fn finish(mut self) -> Result<SessionOutcome, SpeechError> {
        let Some(task) = self.task.take() else {
            return Ok(SessionOutcome::Cancelled);
        };

        match task.await {
            Ok(result) => result,
            Err(e) => Err(SpeechError::Disconnected(format!(
                "playback task failed: {}",
                e
            ))),
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Result of one turn of the event loop
enum Wake {
    Cancelled,
    Connected(Result<Box<dyn Transport>, SpeechError>),
    Inbound(TransportEvent),
    Decoded(u64, Result<AudioChunk, String>),
    Played(Played),
    Watchdog,
}

/// Resources of one running session
struct Session<'a> {
    player: &'a StreamingAudioPlayer,
    request: &'a SpeakRequest,
    events: &'a mpsc::UnboundedSender<PlaybackEvent>,
    session_id: Uuid,
    state: State,
    connecting: Option<ConnectFuture>,
    transport: Option<Box<dyn Transport>>,
    decodes: FuturesUnordered<DecodeFuture>,
    playing: Option<PlayFuture>,
    watchdog: Option<Pin<Box<Sleep>>>,
    followups: VecDeque<Event>,
    metrics: SessionRecorder,
}

impl<'a> Session<'a> {
    fn new(
        player: &'a StreamingAudioPlayer,
        request: &'a SpeakRequest,
        events: &'a mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        Self {
            player,
            request,
            events,
            session_id,
            state: State::Idle,
            connecting: None,
            transport: None,
            decodes: FuturesUnordered::new(),
            playing: None,
            watchdog: None,
            followups: VecDeque::new(),
            metrics: SessionRecorder::new(session_id),
        }
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<SessionOutcome, SpeechError> {
        log::info!(
            "Speech session {} starting (voice {})",
            self.session_id,
            self.request.voice.voice_id
        );

        self.dispatch(Event::Start {
            session_id: self.session_id,
            has_text: self.request.text().is_some(),
            has_credential: self.request.api_key().is_some(),
        })
        .await;

        while !self.state.is_terminal() {
            let wake = tokio::select! {
                biased;

                _ = cancel.cancelled() => Wake::Cancelled,
                result = connect_or_pending(&mut self.connecting) => Wake::Connected(result),
                event = recv_or_pending(&mut self.transport) => Wake::Inbound(event),
                Some((sequence, result)) = self.decodes.next(), if !self.decodes.is_empty() => {
                    Wake::Decoded(sequence, result)
                }
                played = play_or_pending(&mut self.playing) => Wake::Played(played),
                _ = sleep_or_pending(&mut self.watchdog) => Wake::Watchdog,
            };

            self.handle_wake(wake).await;
        }

        self.release().await;
        self.outcome()
    }

    async fn handle_wake(&mut self, wake: Wake) {
        let session_id = self.session_id;

        match wake {
            Wake::Cancelled => {
                log::info!("Speech session {} cancelled", session_id);
                self.dispatch(Event::Cancel).await;
            }
            Wake::Connected(result) => {
                self.connecting = None;
                match result {
                    Ok(transport) => {
                        self.transport = Some(transport);
                        self.dispatch(Event::Connected { session_id }).await;
                    }
                    Err(e) => {
                        log::warn!("Speech session {} failed to connect: {}", session_id, e);
                        let err = match e {
                            SpeechError::ConnectionFailed(reason) => reason,
                            other => other.to_string(),
                        };
                        self.dispatch(Event::ConnectFailed { session_id, err }).await;
                    }
                }
            }
            Wake::Inbound(TransportEvent::Message(msg)) => {
                if let Some(code) = msg.error_code() {
                    log::warn!(
                        "Provider error {}: {}",
                        code,
                        msg.message.as_deref().unwrap_or("no detail")
                    );
                    let code = code.to_string();
                    self.dispatch(Event::ProviderError { session_id, code }).await;
                    return;
                }
                if let Some(payload) = msg.audio_payload() {
                    self.metrics.chunk_received();
                    let payload = payload.to_string();
                    self.dispatch(Event::AudioReceived {
                        session_id,
                        payload,
                    })
                    .await;
                }
                if msg.is_final() {
                    log::debug!("Speech session {} received final message", session_id);
                    self.dispatch(Event::FinalReceived { session_id }).await;
                }
            }
            Wake::Inbound(TransportEvent::Closed { normal, reason }) => {
                // Peer is gone; nothing left to close
                self.transport = None;
                self.dispatch(Event::TransportClosed {
                    session_id,
                    normal,
                    reason,
                })
                .await;
            }
            Wake::Decoded(sequence, Ok(mut chunk)) => {
                chunk.sequence = sequence;
                self.metrics.chunk_decoded();
                self.dispatch(Event::ChunkDecoded { session_id, chunk }).await;
            }
            Wake::Decoded(sequence, Err(e)) => {
                log::warn!("Dropping audio chunk {}: {}", sequence, e);
                self.metrics.chunk_dropped();
                self.dispatch(Event::DecodeFailed {
                    session_id,
                    sequence,
                })
                .await;
            }
            Wake::Played(Played {
                sequence,
                duration_ms,
                result,
            }) => {
                self.playing = None;
                let completed = match result {
                    Ok(()) => {
                        self.metrics.chunk_played(duration_ms);
                        true
                    }
                    Err(e) => {
                        log::warn!("Playback of chunk {} failed: {}", sequence, e);
                        false
                    }
                };
                self.dispatch(Event::PlaybackFinished {
                    session_id,
                    sequence,
                    completed,
                })
                .await;
            }
            Wake::Watchdog => {
                self.watchdog = None;
                log::warn!(
                    "Speech session {} exceeded {:?}",
                    session_id,
                    self.player.config.watchdog
                );
                self.dispatch(Event::WatchdogFired {
                    session_id,
                    after: self.player.config.watchdog,
                })
                .await;
            }
        }
    }

    /// Reduce an event, execute its effects, and repeat for any follow-ups
    async fn dispatch(&mut self, event: Event) {
        self.followups.push_back(event);

        while let Some(event) = self.followups.pop_front() {
            let previous = self.state.name();
            let (next, effects) = reduce(std::mem::take(&mut self.state), event);
            self.state = next;

            if previous != self.state.name() {
                log::debug!(
                    "Speech session {}: {} -> {}",
                    self.session_id,
                    previous,
                    self.state.name()
                );
            }

            for effect in effects {
                self.execute(effect).await;
            }
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Connect => {
                let url = (self.player.url_builder)(&self.request.voice);
                let connector = self.player.connector.clone();
                let connect_timeout = self.player.config.connect_timeout;

                let connect: ConnectFuture = Box::pin(async move {
                    match timeout(connect_timeout, connector.connect(&url)).await {
                        Ok(result) => result,
                        Err(_) => Err(SpeechError::ConnectionFailed(
                            "Connection timeout".to_string(),
                        )),
                    }
                });
                self.connecting = Some(connect);
            }
            Effect::SendInitiation => {
                if let Err(e) = self.send_initiation().await {
                    log::warn!("Failed to send initiation message: {}", e);
                    self.followups.push_back(Event::TransportClosed {
                        session_id: self.session_id,
                        normal: false,
                        reason: e.to_string(),
                    });
                }
            }
            Effect::StartWatchdog => {
                self.watchdog = Some(Box::pin(sleep(self.player.config.watchdog)));
            }
            Effect::Decode { sequence, payload } => {
                let decoder = self.player.decoder.clone();
                self.decodes.push(Box::pin(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        let bytes = decode_payload(&payload)?;
                        decoder.decode(sequence, &bytes)
                    })
                    .await;

                    match result {
                        Ok(decoded) => (sequence, decoded.map_err(|e| e.to_string())),
                        Err(e) => (sequence, Err(format!("decode task failed: {}", e))),
                    }
                }));
            }
            Effect::Play { chunk } => {
                let sequence = chunk.sequence;
                let duration_ms = chunk.duration_ms();
                self.metrics.playback_started();

                let sink = self.player.sink.clone();
                let session_id = self.session_id;
                let play: PlayFuture = Box::pin(async move {
                    let result = sink.play(session_id, chunk).await;
                    Played {
                        sequence,
                        duration_ms,
                        result,
                    }
                });
                self.playing = Some(play);
            }
            Effect::StopPlayback => {
                self.player.sink.stop(self.session_id);
                self.playing = None;
            }
            Effect::CloseTransport => {
                if let Some(mut transport) = self.transport.take() {
                    transport.close().await;
                }
            }
            Effect::EmitSpeaking(speaking) => {
                log::info!(
                    "Speech session {} speaking: {}",
                    self.session_id,
                    speaking
                );
                let _ = self.events.send(PlaybackEvent::SpeakingChanged {
                    session_id: self.session_id,
                    speaking,
                });
            }
        }
    }

    async fn send_initiation(&mut self) -> Result<(), SpeechError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SpeechError::Disconnected("no open connection".to_string()))?;

        let text = self.request.text().unwrap_or_default();
        let api_key = self.request.api_key().unwrap_or_default();

        for message in [
            ClientMessage::initiate(text, &self.request.voice, api_key),
            ClientMessage::end_of_input(),
        ] {
            let json = serde_json::to_string(&message)
                .map_err(|e| SpeechError::Disconnected(format!("serialize failed: {}", e)))?;
            transport.send_text(json).await?;
        }

        log::debug!("Initiation sent ({} chars)", text.len());
        Ok(())
    }

    /// Drop anything still in flight once the session is over
    async fn release(&mut self) {
        self.connecting = None;
        self.watchdog = None;
        self.decodes.clear();
        if self.playing.take().is_some() {
            self.player.sink.stop(self.session_id);
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn outcome(&self) -> Result<SessionOutcome, SpeechError> {
        match &self.state {
            State::Done { .. } => {
                log::info!("Speech session {} finished", self.session_id);
                Ok(SessionOutcome::Completed(self.metrics.finish()))
            }
            State::Failed { error, .. } => {
                log::error!("Speech session {} failed: {}", self.session_id, error);
                Err(error.clone())
            }
            State::Cancelled { .. } => Ok(SessionOutcome::Cancelled),
            other => Err(SpeechError::Disconnected(format!(
                "session ended in state {}",
                other.name()
            ))),
        }
    }
}

async fn connect_or_pending(
    connecting: &mut Option<ConnectFuture>,
) -> Result<Box<dyn Transport>, SpeechError> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn recv_or_pending(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport {
        Some(t) => t.recv().await,
        None => pending().await,
    }
}

async fn play_or_pending(playing: &mut Option<PlayFuture>) -> Played {
    match playing {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn sleep_or_pending(watchdog: &mut Option<Pin<Box<Sleep>>>) {
    match watchdog {
        Some(sleep) => sleep.await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rejects_blank_text_and_key() {
        let request = SpeakRequest::new("   ", Some("  ".to_string()));
        assert!(request.text().is_none());
        assert!(request.api_key().is_none());

        let request = SpeakRequest::new(" Nice close ", Some("key".to_string()));
        assert_eq!(request.text(), Some("Nice close"));
        assert_eq!(request.api_key(), Some("key"));
    }

    #[test]
    fn test_default_player_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.watchdog, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
