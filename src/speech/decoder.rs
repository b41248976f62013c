//! Audio chunk decoding
//!
//! Turns the base64 `audio` field of one inbound message into a playable
//! buffer of mono `f32` samples. The provider is asked for raw 16-bit PCM;
//! WAV payloads are recognised by their RIFF header and read with `hound`.

use std::io::Cursor;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};

/// Errors that can occur while decoding a single chunk
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    InvalidBase64(String),
    Empty,
    /// PCM16 payloads must have an even number of bytes
    OddLength(usize),
    Wav(String),
    UnsupportedFormat(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidBase64(e) => write!(f, "Invalid base64 audio: {}", e),
            DecodeError::Empty => write!(f, "Audio chunk is empty"),
            DecodeError::OddLength(len) => {
                write!(f, "PCM16 chunk has odd length ({} bytes)", len)
            }
            DecodeError::Wav(e) => write!(f, "Invalid WAV chunk: {}", e),
            DecodeError::UnsupportedFormat(fmt) => {
                write!(f, "Unsupported output format: {}", fmt)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// One decoded chunk of audio, ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Mono samples in -1.0 ..= 1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Arrival order within the session (monotonically increasing)
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration().as_millis() as u64
    }
}

/// Decodes the raw bytes of one chunk
///
/// Called from the blocking pool, so implementations may be CPU heavy.
pub trait ChunkDecoder: Send + Sync + 'static {
    fn decode(&self, sequence: u64, bytes: &[u8]) -> Result<AudioChunk, DecodeError>;
}

/// Base64-decode the `audio` field of an inbound message
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}

/// Decoder for the provider's `pcm_<rate>` output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDecoder {
    pcm_sample_rate: u32,
}

impl FormatDecoder {
    pub fn new(pcm_sample_rate: u32) -> Self {
        Self { pcm_sample_rate }
    }

    /// Build a decoder for an output format such as `pcm_24000`
    pub fn for_output_format(format: &str) -> Result<Self, DecodeError> {
        let rate = format
            .strip_prefix("pcm_")
            .and_then(|r| r.parse::<u32>().ok())
            .filter(|r| *r > 0)
            .ok_or_else(|| DecodeError::UnsupportedFormat(format.to_string()))?;
        Ok(Self::new(rate))
    }

    pub fn pcm_sample_rate(&self) -> u32 {
        self.pcm_sample_rate
    }
}

impl ChunkDecoder for FormatDecoder {
    fn decode(&self, sequence: u64, bytes: &[u8]) -> Result<AudioChunk, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        if bytes.starts_with(b"RIFF") {
            return decode_wav(sequence, bytes);
        }

        let samples = pcm16_to_f32(bytes)?;
        Ok(AudioChunk::new(samples, self.pcm_sample_rate, sequence))
    }
}

/// Convert little-endian PCM16 bytes to normalized samples
fn pcm16_to_f32(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Decode a complete WAV file, mixing down to mono
fn decode_wav(sequence: u64, bytes: &[u8]) -> Result<AudioChunk, DecodeError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| DecodeError::Wav(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| DecodeError::Wav(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| DecodeError::Wav(e.to_string()))?
        }
    };

    if interleaved.is_empty() {
        return Err(DecodeError::Empty);
    }

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(AudioChunk::new(samples, spec.sample_rate, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_payload_base64() {
        let bytes = decode_payload("AAEC").unwrap();
        assert_eq!(bytes, vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_payload_invalid() {
        assert!(matches!(
            decode_payload("not base64!!"),
            Err(DecodeError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_pcm_decoding() {
        let decoder = FormatDecoder::new(24000);
        // 0x4000 = 16384 -> 0.5, 0xC000 = -16384 -> -0.5
        let chunk = decoder.decode(7, &[0x00, 0x40, 0x00, 0xC0]).unwrap();

        assert_eq!(chunk.samples, vec![0.5, -0.5]);
        assert_eq!(chunk.sample_rate, 24000);
        assert_eq!(chunk.sequence, 7);
    }

    #[test]
    fn test_pcm_odd_length_is_rejected() {
        let decoder = FormatDecoder::new(24000);
        assert_eq!(
            decoder.decode(0, &[0x00, 0x40, 0x00]),
            Err(DecodeError::OddLength(3))
        );
    }

    #[test]
    fn test_empty_chunk_is_rejected() {
        let decoder = FormatDecoder::new(24000);
        assert_eq!(decoder.decode(0, &[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_wav_decoding_mixes_to_mono() {
        let bytes = wav_bytes(&[16384, 0, -16384, -16384], 2, 16000);
        let decoder = FormatDecoder::new(24000);
        let chunk = decoder.decode(1, &bytes).unwrap();

        assert_eq!(chunk.sample_rate, 16000);
        assert_eq!(chunk.samples.len(), 2);
        assert!((chunk.samples[0] - 0.25).abs() < 1e-4);
        assert!((chunk.samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_truncated_wav_is_rejected() {
        let decoder = FormatDecoder::new(24000);
        let result = decoder.decode(0, b"RIFF\x10\x00");
        assert!(matches!(result, Err(DecodeError::Wav(_))));
    }

    #[test]
    fn test_for_output_format() {
        assert_eq!(
            FormatDecoder::for_output_format("pcm_16000")
                .unwrap()
                .pcm_sample_rate(),
            16000
        );
        assert!(matches!(
            FormatDecoder::for_output_format("mp3_44100_128"),
            Err(DecodeError::UnsupportedFormat(_))
        ));
        assert!(FormatDecoder::for_output_format("pcm_0").is_err());
    }

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk::new(vec![0.0; 24000], 24000, 0);
        assert_eq!(chunk.duration_ms(), 1000);

        let chunk = AudioChunk::new(vec![0.0; 100], 0, 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }
}
