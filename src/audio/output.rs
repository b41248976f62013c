//! Audio output using CPAL
//!
//! `CpalSink` mixes the chunks of every active session on the default output
//! device. The CPAL stream lives on a dedicated thread (it is not `Send` on
//! every platform); the output callback pulls samples from shared state and
//! signals each session as soon as its next chunk can be appended without a
//! gap.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::speech::AudioChunk;

/// A chunk counts as played once no more than this many device buffers of
/// it remain
const LOOKAHEAD_BUFFERS: usize = 2;

/// Errors that can occur during audio output.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    /// Playback was stopped before the chunk finished
    Interrupted,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio output configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::Interrupted => write!(f, "Playback interrupted"),
        }
    }
}

impl std::error::Error for AudioError {}

/// Platform audio output driven by the player
///
/// Playback is scoped to a session id: chunks of one session play in the
/// order they were handed over, sessions never interrupt each other, and
/// `stop` only silences the given session. `play` resolves once the next
/// chunk of the same session may be handed over; the player never calls it
/// again for that session before then.
#[async_trait]
pub trait AudioSink: Send + Sync + 'static {
    async fn play(&self, session: Uuid, chunk: AudioChunk) -> Result<(), AudioError>;

    /// Silence `session` immediately, abandoning its current chunk
    fn stop(&self, session: Uuid);
}

/// Audio one session has handed to the device
#[derive(Default)]
struct Voice {
    samples: VecDeque<f32>,
    done: Option<oneshot::Sender<()>>,
}

/// Per-session audio waiting to be mixed into the device output
#[derive(Default)]
struct OutputState {
    voices: HashMap<Uuid, Voice>,
}

impl OutputState {
    /// Append a chunk after whatever the session still has queued
    fn enqueue(&mut self, session: Uuid, samples: Vec<f32>, done: oneshot::Sender<()>) {
        let voice = self.voices.entry(session).or_default();
        voice.samples.extend(samples);
        voice.done = Some(done);
    }

    /// Drop everything queued for `session`; its pending `play` sees `Interrupted`
    fn stop(&mut self, session: Uuid) {
        self.voices.remove(&session);
    }

    /// Next mono output sample, summed over every session
    fn next_frame(&mut self) -> f32 {
        let mixed: f32 = self
            .voices
            .values_mut()
            .filter_map(|voice| voice.samples.pop_front())
            .sum();
        mixed.clamp(-1.0, 1.0)
    }

    /// Signal sessions whose queued audio runs out within `frames` frames,
    /// then forget sessions with nothing left
    fn release_ready(&mut self, frames: usize) {
        for voice in self.voices.values_mut() {
            if voice.samples.len() <= frames {
                if let Some(done) = voice.done.take() {
                    let _ = done.send(());
                }
            }
        }
        self.voices
            .retain(|_, voice| !voice.samples.is_empty() || voice.done.is_some());
    }
}

/// Audio sink on the default output device
pub struct CpalSink {
    state: Arc<Mutex<OutputState>>,
    sample_rate: u32,
    channels: u16,
    /// Dropping this ends the stream thread
    _shutdown: std_mpsc::Sender<()>,
}

impl CpalSink {
    /// Open the default output device.
    pub fn new() -> Result<Self, AudioError> {
        let state = Arc::new(Mutex::new(OutputState::default()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(u32, u16), AudioError>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_state = state.clone();
        std::thread::Builder::new()
            .name("coach-voice-output".to_string())
            .spawn(move || match open_stream(thread_state) {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    // Park until the sink is dropped; the stream must stay on this thread
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    log::debug!("Audio output thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))??;

        Ok(Self {
            state,
            sample_rate,
            channels,
            _shutdown: shutdown_tx,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, session: Uuid, chunk: AudioChunk) -> Result<(), AudioError> {
        let samples = resample_linear(&chunk.samples, chunk.sample_rate, self.sample_rate);
        let (done_tx, done_rx) = oneshot::channel();

        self.state
            .lock()
            .map_err(|_| AudioError::StreamCreationFailed("output state poisoned".into()))?
            .enqueue(session, samples, done_tx);

        log::debug!(
            "Playing chunk {} of session {} ({} ms)",
            chunk.sequence,
            session,
            chunk.duration_ms()
        );

        // Sender dropped without firing means stop() discarded the chunk
        done_rx.await.map_err(|_| AudioError::Interrupted)
    }

    fn stop(&self, session: Uuid) {
        if let Ok(mut state) = self.state.lock() {
            state.stop(session);
        }
    }
}

fn open_stream(state: Arc<Mutex<OutputState>>) -> Result<(Stream, u32, u16), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Output config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, state),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, state),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, state),
        other => Err(AudioError::StreamCreationFailed(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    Ok((stream, config.sample_rate.0, config.channels))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    state: Arc<Mutex<OutputState>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let Ok(mut state) = state.lock() else {
                    return;
                };
                // Mono mix fanned out to every device channel
                let mut frames = 0;
                for frame in data.chunks_mut(channels) {
                    let sample = state.next_frame();
                    for out in frame.iter_mut() {
                        *out = T::from_sample(sample);
                    }
                    frames += 1;
                }
                state.release_ready(frames * LOOKAHEAD_BUFFERS);
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Resample mono audio by linear interpolation
///
/// Returns the input unchanged if either rate is zero or the rates match.
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}
