//! State machine for one speech session
//!
//! All transitions go through [`reduce`], which returns the next state and
//! the effects the player must execute. The reducer owns the playback
//! queue, so ordering and completion rules live here and nowhere else.
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Streaming ─▶ Draining ─▶ Done
//!             │             │            │
//!             └─────────────┴────────────┴──▶ Failed | Cancelled
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use uuid::Uuid;

use super::decoder::AudioChunk;
use super::SpeechError;

/// Audio bookkeeping for a connected session
#[derive(Debug, Clone, Default)]
pub struct Playback {
    /// Decoded chunks waiting to play, in arrival order
    pub queue: VecDeque<AudioChunk>,
    /// Decodes finished out of order, keyed by sequence (`None` = dropped)
    reorder: BTreeMap<u64, Option<AudioChunk>>,
    /// Sequence assigned to the next inbound chunk
    next_sequence: u64,
    /// Next sequence allowed into `queue`
    next_release: u64,
    /// Sequence currently handed to the sink
    pub playing: Option<u64>,
    pub speaking: bool,
    pub transport_open: bool,
    pub played: u64,
    pub dropped: u64,
}

impl Playback {
    fn connected() -> Self {
        Self {
            transport_open: true,
            ..Default::default()
        }
    }

    /// Chunks received but not yet released into the queue
    pub fn outstanding_decodes(&self) -> u64 {
        self.next_sequence - self.next_release
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.playing.is_none() && self.outstanding_decodes() == 0
    }

    /// Record a finished decode and release every chunk that is now in order
    fn resolve(&mut self, sequence: u64, chunk: Option<AudioChunk>) {
        if sequence < self.next_release || sequence >= self.next_sequence {
            log::debug!("Ignoring decode result for unknown sequence {}", sequence);
            return;
        }
        self.reorder.insert(sequence, chunk);

        while let Some(resolved) = self.reorder.remove(&self.next_release) {
            match resolved {
                Some(chunk) => self.queue.push_back(chunk),
                None => self.dropped += 1,
            }
            self.next_release += 1;
        }
    }
}

/// Lifecycle of a speech session
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Connecting {
        session_id: Uuid,
    },
    Streaming {
        session_id: Uuid,
        playback: Playback,
    },
    /// End of stream observed; only playing out what is left
    Draining {
        session_id: Uuid,
        playback: Playback,
    },
    Done {
        session_id: Uuid,
        played: u64,
        dropped: u64,
    },
    Failed {
        session_id: Option<Uuid>,
        error: SpeechError,
    },
    Cancelled {
        session_id: Option<Uuid>,
    },
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Done { .. } | State::Failed { .. } | State::Cancelled { .. }
        )
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::Connecting { session_id }
            | State::Streaming { session_id, .. }
            | State::Draining { session_id, .. }
            | State::Done { session_id, .. } => Some(*session_id),
            State::Failed { session_id, .. } | State::Cancelled { session_id } => *session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Connecting { .. } => "connecting",
            State::Streaming { .. } => "streaming",
            State::Draining { .. } => "draining",
            State::Done { .. } => "done",
            State::Failed { .. } => "failed",
            State::Cancelled { .. } => "cancelled",
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum Event {
    Start {
        session_id: Uuid,
        has_text: bool,
        has_credential: bool,
    },
    Connected {
        session_id: Uuid,
    },
    ConnectFailed {
        session_id: Uuid,
        err: String,
    },
    AudioReceived {
        session_id: Uuid,
        payload: String,
    },
    ChunkDecoded {
        session_id: Uuid,
        chunk: AudioChunk,
    },
    DecodeFailed {
        session_id: Uuid,
        sequence: u64,
    },
    FinalReceived {
        session_id: Uuid,
    },
    ProviderError {
        session_id: Uuid,
        code: String,
    },
    TransportClosed {
        session_id: Uuid,
        normal: bool,
        reason: String,
    },
    /// The sink returned a chunk; `completed` is false if it errored
    PlaybackFinished {
        session_id: Uuid,
        sequence: u64,
        completed: bool,
    },
    WatchdogFired {
        session_id: Uuid,
        after: Duration,
    },
    /// Caller gave up on the session
    Cancel,
}

impl Event {
    fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::Start { session_id, .. }
            | Event::Connected { session_id }
            | Event::ConnectFailed { session_id, .. }
            | Event::AudioReceived { session_id, .. }
            | Event::ChunkDecoded { session_id, .. }
            | Event::DecodeFailed { session_id, .. }
            | Event::FinalReceived { session_id }
            | Event::ProviderError { session_id, .. }
            | Event::TransportClosed { session_id, .. }
            | Event::PlaybackFinished { session_id, .. }
            | Event::WatchdogFired { session_id, .. } => Some(*session_id),
            Event::Cancel => None,
        }
    }
}

/// Work for the player to carry out after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect,
    /// Send the initiation and end-of-input messages
    SendInitiation,
    StartWatchdog,
    Decode { sequence: u64, payload: String },
    Play { chunk: AudioChunk },
    StopPlayback,
    CloseTransport,
    EmitSpeaking(bool),
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Events for another session are ignored
/// - Terminal states absorb every event
/// - `EmitSpeaking(false)` follows every `EmitSpeaking(true)` exactly once
///
/// Takes the state by value so queued audio is moved, never copied.
pub fn reduce(state: State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use State::*;

    if state.is_terminal() {
        return (state, vec![]);
    }

    // Stale events from a superseded session never touch this queue
    if let (Some(current), Some(eid)) = (state.session_id(), event.session_id()) {
        if current != eid {
            log::debug!("Dropping stale event for session {}", eid);
            return (state, vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (
            Idle,
            Event::Start {
                session_id,
                has_text,
                has_credential,
            },
        ) => {
            if !has_text || !has_credential {
                let reason = if !has_text { "no text" } else { "no API key" };
                (
                    Failed {
                        session_id: Some(session_id),
                        error: SpeechError::MissingCredentials(reason.to_string()),
                    },
                    vec![],
                )
            } else {
                (Connecting { session_id }, vec![Connect])
            }
        }
        (Idle, Event::Cancel) => (Cancelled { session_id: None }, vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id }, Event::Connected { .. }) => (
            Streaming {
                session_id,
                playback: Playback::connected(),
            },
            vec![SendInitiation, StartWatchdog],
        ),
        (Connecting { session_id }, Event::ConnectFailed { err, .. }) => (
            Failed {
                session_id: Some(session_id),
                error: SpeechError::ConnectionFailed(err),
            },
            vec![],
        ),
        (Connecting { session_id }, Event::Cancel) => (
            Cancelled {
                session_id: Some(session_id),
            },
            vec![],
        ),

        // -----------------
        // Streaming / Draining
        // -----------------
        (
            Streaming {
                session_id,
                playback,
            },
            event,
        ) => active(session_id, playback, false, event),
        (
            Draining {
                session_id,
                playback,
            },
            event,
        ) => active(session_id, playback, true, event),

        // -----------------
        // Unhandled: no transition
        // -----------------
        (state, _) => (state, vec![]),
    }
}

fn active(
    session_id: Uuid,
    mut playback: Playback,
    mut draining: bool,
    event: Event,
) -> (State, Vec<Effect>) {
    let mut effects = Vec::new();

    match event {
        Event::AudioReceived { payload, .. } => {
            if draining {
                log::debug!("Audio received after end of stream, still queueing it");
            }
            let sequence = playback.next_sequence;
            playback.next_sequence += 1;
            effects.push(Effect::Decode { sequence, payload });
        }
        Event::ChunkDecoded { chunk, .. } => {
            let sequence = chunk.sequence;
            playback.resolve(sequence, Some(chunk));
        }
        Event::DecodeFailed { sequence, .. } => {
            playback.resolve(sequence, None);
        }
        Event::FinalReceived { .. } => {
            draining = true;
        }
        Event::PlaybackFinished {
            sequence,
            completed,
            ..
        } => {
            if playback.playing == Some(sequence) {
                playback.playing = None;
                if completed {
                    playback.played += 1;
                }
            }
        }
        Event::TransportClosed { normal: true, .. } => {
            playback.transport_open = false;
            draining = true;
        }
        Event::TransportClosed {
            normal: false,
            reason,
            ..
        } => {
            playback.transport_open = false;
            return fail(session_id, playback, SpeechError::Disconnected(reason));
        }
        Event::ProviderError { code, .. } => {
            return fail(session_id, playback, SpeechError::Provider { code });
        }
        Event::WatchdogFired { after, .. } => {
            return fail(session_id, playback, SpeechError::Timeout(after));
        }
        Event::Cancel => {
            let effects = release(&playback);
            return (
                State::Cancelled {
                    session_id: Some(session_id),
                },
                effects,
            );
        }
        Event::Start { .. } | Event::Connected { .. } | Event::ConnectFailed { .. } => {
            return (wrap(session_id, playback, draining), vec![]);
        }
    }

    // Start the next chunk if the sink is idle
    if playback.playing.is_none() {
        if let Some(chunk) = playback.queue.pop_front() {
            if !playback.speaking {
                playback.speaking = true;
                effects.push(Effect::EmitSpeaking(true));
            }
            playback.playing = Some(chunk.sequence);
            effects.push(Effect::Play { chunk });
        }
    }

    if draining && playback.is_drained() {
        if playback.transport_open {
            effects.push(Effect::CloseTransport);
        }
        if playback.speaking {
            effects.push(Effect::EmitSpeaking(false));
        }
        return (
            State::Done {
                session_id,
                played: playback.played,
                dropped: playback.dropped,
            },
            effects,
        );
    }

    (wrap(session_id, playback, draining), effects)
}

fn wrap(session_id: Uuid, playback: Playback, draining: bool) -> State {
    if draining {
        State::Draining {
            session_id,
            playback,
        }
    } else {
        State::Streaming {
            session_id,
            playback,
        }
    }
}

/// Effects that tear down an active session
fn release(playback: &Playback) -> Vec<Effect> {
    let mut effects = Vec::new();
    if playback.playing.is_some() {
        effects.push(Effect::StopPlayback);
    }
    if playback.transport_open {
        effects.push(Effect::CloseTransport);
    }
    if playback.speaking {
        effects.push(Effect::EmitSpeaking(false));
    }
    effects
}

fn fail(session_id: Uuid, playback: Playback, error: SpeechError) -> (State, Vec<Effect>) {
    (
        State::Failed {
            session_id: Some(session_id),
            error,
        },
        release(&playback),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u64, secs: u32) -> AudioChunk {
        AudioChunk::new(vec![0.0; 10 * secs as usize], 10, sequence)
    }

    fn connected(id: Uuid) -> State {
        let (state, _) = reduce(State::Idle, start(id));
        let (state, _) = reduce(state, Event::Connected { session_id: id });
        state
    }

    fn start(id: Uuid) -> Event {
        Event::Start {
            session_id: id,
            has_text: true,
            has_credential: true,
        }
    }

    fn audio(id: Uuid) -> Event {
        Event::AudioReceived {
            session_id: id,
            payload: "AAAA".to_string(),
        }
    }

    /// Feed events in order, collecting every effect
    fn run(state: State, events: Vec<Event>) -> (State, Vec<Effect>) {
        let mut state = state;
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = reduce(state, event);
            state = next;
            all.extend(effects);
        }
        (state, all)
    }

    fn played_sequences(effects: &[Effect]) -> Vec<u64> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Play { chunk } => Some(chunk.sequence),
                _ => None,
            })
            .collect()
    }

    fn speaking_flips(effects: &[Effect]) -> Vec<bool> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::EmitSpeaking(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_without_credential_fails_without_connecting() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            State::Idle,
            Event::Start {
                session_id: id,
                has_text: true,
                has_credential: false,
            },
        );

        assert!(matches!(
            next,
            State::Failed {
                error: SpeechError::MissingCredentials(_),
                ..
            }
        ));
        assert!(!effects.contains(&Effect::Connect));
    }

    #[test]
    fn start_without_text_fails_without_connecting() {
        let (next, effects) = reduce(
            State::Idle,
            Event::Start {
                session_id: Uuid::new_v4(),
                has_text: false,
                has_credential: true,
            },
        );
        assert!(matches!(next, State::Failed { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn connect_sends_initiation_and_arms_watchdog() {
        let id = Uuid::new_v4();
        let (state, effects) = reduce(State::Idle, start(id));
        assert!(matches!(state, State::Connecting { .. }));
        assert_eq!(effects, vec![Effect::Connect]);

        let (state, effects) = reduce(state, Event::Connected { session_id: id });
        assert!(matches!(state, State::Streaming { .. }));
        assert_eq!(effects, vec![Effect::SendInitiation, Effect::StartWatchdog]);
    }

    #[test]
    fn audio_is_assigned_increasing_sequences() {
        let id = Uuid::new_v4();
        let (_, effects) = run(connected(id), vec![audio(id), audio(id), audio(id)]);
        let sequences: Vec<u64> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Decode { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn out_of_order_decodes_play_in_arrival_order() {
        let id = Uuid::new_v4();
        let (_, effects) = run(
            connected(id),
            vec![
                audio(id),
                audio(id),
                audio(id),
                // Decodes complete 2, 0, 1
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(2, 1),
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(1, 1),
                },
                Event::PlaybackFinished {
                    session_id: id,
                    sequence: 0,
                    completed: true,
                },
                Event::PlaybackFinished {
                    session_id: id,
                    sequence: 1,
                    completed: true,
                },
            ],
        );
        assert_eq!(played_sequences(&effects), vec![0, 1, 2]);
    }

    #[test]
    fn only_one_chunk_plays_at_a_time() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                audio(id),
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(1, 2),
                },
            ],
        );
        assert_eq!(played_sequences(&effects), vec![0]);
        match state {
            State::Streaming { playback, .. } => {
                assert_eq!(playback.playing, Some(0));
                assert_eq!(playback.queue.len(), 1);
            }
            other => panic!("Expected Streaming, got {:?}", other),
        }
    }

    #[test]
    fn failed_decode_is_skipped_without_failing() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                audio(id),
                Event::DecodeFailed {
                    session_id: id,
                    sequence: 0,
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(1, 1),
                },
            ],
        );
        assert_eq!(played_sequences(&effects), vec![1]);
        assert!(matches!(state, State::Streaming { .. }));
    }

    #[test]
    fn final_before_queue_drains_waits_for_playback() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                audio(id),
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(1, 2),
                },
                Event::FinalReceived { session_id: id },
            ],
        );
        assert!(matches!(state, State::Draining { .. }));
        assert_eq!(speaking_flips(&effects), vec![true]);

        let (state, _) = reduce(
            state,
            Event::PlaybackFinished {
                session_id: id,
                sequence: 0,
                completed: true,
            },
        );
        assert!(matches!(state, State::Draining { .. }));

        let (state, effects) = reduce(
            state,
            Event::PlaybackFinished {
                session_id: id,
                sequence: 1,
                completed: true,
            },
        );
        assert!(matches!(state, State::Done { played: 2, .. }));
        assert!(effects.contains(&Effect::CloseTransport));
        assert_eq!(speaking_flips(&effects), vec![false]);
    }

    #[test]
    fn failed_playback_advances_without_counting() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                audio(id),
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(1, 1),
                },
                Event::FinalReceived { session_id: id },
                Event::PlaybackFinished {
                    session_id: id,
                    sequence: 0,
                    completed: false,
                },
                Event::PlaybackFinished {
                    session_id: id,
                    sequence: 1,
                    completed: true,
                },
            ],
        );
        assert_eq!(played_sequences(&effects), vec![0, 1]);
        assert!(matches!(state, State::Done { played: 1, .. }));
    }

    #[test]
    fn final_waits_for_outstanding_decodes() {
        let id = Uuid::new_v4();
        let (state, _) = run(
            connected(id),
            vec![audio(id), Event::FinalReceived { session_id: id }],
        );
        assert!(matches!(state, State::Draining { .. }));

        let (state, effects) = reduce(
            state,
            Event::DecodeFailed {
                session_id: id,
                sequence: 0,
            },
        );
        assert!(matches!(state, State::Done { dropped: 1, .. }));
        // Never spoke, so no speaking flip
        assert!(speaking_flips(&effects).is_empty());
    }

    #[test]
    fn normal_close_with_empty_queue_completes() {
        let id = Uuid::new_v4();
        let (state, effects) = reduce(
            connected(id),
            Event::TransportClosed {
                session_id: id,
                normal: true,
                reason: "done".to_string(),
            },
        );
        assert!(matches!(state, State::Done { .. }));
        assert!(!effects.contains(&Effect::CloseTransport));
    }

    #[test]
    fn abnormal_close_before_drain_fails() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::TransportClosed {
                    session_id: id,
                    normal: false,
                    reason: "reset".to_string(),
                },
            ],
        );
        assert!(matches!(
            state,
            State::Failed {
                error: SpeechError::Disconnected(_),
                ..
            }
        ));
        assert!(effects.contains(&Effect::StopPlayback));
        assert!(!effects.contains(&Effect::CloseTransport));
        assert_eq!(speaking_flips(&effects), vec![true, false]);
    }

    #[test]
    fn provider_error_discards_queue() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                audio(id),
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(1, 1),
                },
                Event::ProviderError {
                    session_id: id,
                    code: "detected_unusual_activity".to_string(),
                },
                Event::PlaybackFinished {
                    session_id: id,
                    sequence: 0,
                    completed: true,
                },
                audio(id),
            ],
        );
        assert!(matches!(state, State::Failed { .. }));
        assert_eq!(played_sequences(&effects), vec![0]);
        assert!(effects.contains(&Effect::StopPlayback));
        assert!(effects.contains(&Effect::CloseTransport));
        assert_eq!(speaking_flips(&effects), vec![true, false]);
    }

    #[test]
    fn watchdog_fails_with_timeout() {
        let id = Uuid::new_v4();
        let (state, effects) = reduce(
            connected(id),
            Event::WatchdogFired {
                session_id: id,
                after: Duration::from_secs(30),
            },
        );
        assert!(matches!(
            state,
            State::Failed {
                error: SpeechError::Timeout(_),
                ..
            }
        ));
        assert!(effects.contains(&Effect::CloseTransport));
    }

    #[test]
    fn cancel_releases_without_failure() {
        let id = Uuid::new_v4();
        let (state, effects) = run(
            connected(id),
            vec![
                audio(id),
                Event::ChunkDecoded {
                    session_id: id,
                    chunk: chunk(0, 1),
                },
                Event::Cancel,
            ],
        );
        assert!(matches!(state, State::Cancelled { .. }));
        assert!(effects.contains(&Effect::StopPlayback));
        assert!(effects.contains(&Effect::CloseTransport));
        assert_eq!(speaking_flips(&effects), vec![true, false]);
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let id = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let state = connected(id);
        let (next, effects) = reduce(
            state,
            Event::ChunkDecoded {
                session_id: stale,
                chunk: chunk(0, 1),
            },
        );
        assert!(matches!(next, State::Streaming { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn terminal_states_absorb_events() {
        let id = Uuid::new_v4();
        let state = State::Done {
            session_id: id,
            played: 1,
            dropped: 0,
        };
        let (next, effects) = reduce(state, Event::Cancel);
        assert!(matches!(next, State::Done { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn speaking_flips_back_exactly_once_for_any_terminal_outcome() {
        let id = Uuid::new_v4();
        let terminals = vec![
            Event::Cancel,
            Event::ProviderError {
                session_id: id,
                code: "x".to_string(),
            },
            Event::WatchdogFired {
                session_id: id,
                after: Duration::from_secs(30),
            },
            Event::TransportClosed {
                session_id: id,
                normal: false,
                reason: "reset".to_string(),
            },
        ];

        for terminal in terminals {
            let (_, effects) = run(
                connected(id),
                vec![
                    audio(id),
                    Event::ChunkDecoded {
                        session_id: id,
                        chunk: chunk(0, 1),
                    },
                    terminal,
                    Event::Cancel,
                ],
            );
            assert_eq!(speaking_flips(&effects), vec![true, false]);
        }
    }
}
