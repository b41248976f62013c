//! Audio output for spoken feedback
//!
//! Uses CPAL for playback on the default output device.

mod output;

pub use output::{resample_linear, AudioError, AudioSink, CpalSink};
