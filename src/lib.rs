//! Spoken sales-coaching feedback
//!
//! The core is [`speech::StreamingAudioPlayer`], which speaks text through a
//! streaming text-to-speech WebSocket and plays the audio as it arrives.

pub mod audio;
pub mod credentials;
pub mod metrics;
pub mod playbook;
pub mod settings;
pub mod speech;
pub mod voices;

mod cli;

pub use cli::{run, Cli, Commands};
