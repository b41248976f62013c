//! Command-line interface
//!
//! Thin wrapper over the library: resolves settings and credentials, then
//! drives the player or the playbook generator.

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::audio::CpalSink;
use crate::credentials::{
    mask_key, validate_api_key, CredentialChain, CredentialSource, KeyringCredentials,
    StaticCredential,
};
use crate::playbook::Playbook;
use crate::settings::{load_settings, save_settings, AppSettings};
use crate::speech::{
    FormatDecoder, PlaybackEvent, SessionOutcome, SpeakRequest, StreamingAudioPlayer,
    WebSocketConnector,
};
use crate::voices::{find_voice, is_voice_id, DEFAULT_VOICES};

#[derive(Parser)]
#[command(name = "coach-voice")]
#[command(about = "Spoken sales-coaching feedback over streaming text-to-speech", long_about = None)]
pub struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Speak a piece of feedback
    Speak {
        /// Text to speak
        #[arg(required = true)]
        text: Vec<String>,

        /// Voice id or name (defaults to the saved voice)
        #[arg(long)]
        voice: Option<String>,

        /// Synthesis model id
        #[arg(long)]
        model: Option<String>,

        /// API key (defaults to ELEVENLABS_API_KEY, then the keyring)
        #[arg(long)]
        api_key: Option<String>,

        /// Fail on the first connection error instead of retrying
        #[arg(long)]
        no_retry: bool,
    },
    /// List the built-in voices
    Voices,
    /// Save the default voice
    SetVoice {
        /// Voice id or name
        voice: String,
    },
    /// Store the API key in the OS keyring
    SetKey {
        /// Key to store
        #[arg(conflicts_with = "delete", required_unless_present = "delete")]
        key: Option<String>,

        /// Remove the stored key instead
        #[arg(long)]
        delete: bool,
    },
    /// Check that the configured API key is accepted
    CheckKey {
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Generate a sales playbook
    Playbook {
        #[arg(long)]
        product: String,

        #[arg(long, default_value = "")]
        company: String,

        #[arg(long, default_value = "")]
        persona: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Read a summary aloud
        #[arg(long)]
        speak: bool,
    },
}

pub async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let settings = load_settings();

    match cli.command {
        Commands::Speak {
            text,
            voice,
            model,
            api_key,
            no_retry,
        } => {
            let mut settings = settings;
            if let Some(query) = voice {
                settings.voice_id = resolve_voice(&query)?;
            }
            if let Some(model) = model {
                settings.model_id = model;
            }
            speak(&settings, text.join(" "), api_key, !no_retry).await?;
        }
        Commands::Voices => {
            let current = settings.voice_config().voice_id;
            for voice in DEFAULT_VOICES {
                let marker = if voice.id == current { "*" } else { " " };
                println!("{} {:<8} {}", marker, voice.name, voice.id);
            }
        }
        Commands::SetVoice { voice } => {
            let mut settings = settings;
            settings.voice_id = resolve_voice(&voice)?;
            let path = save_settings(&settings)?;
            println!("Default voice set to {} ({:?})", settings.voice_id, path);
        }
        Commands::SetKey { key, delete } => {
            let keyring = KeyringCredentials::default();
            if delete {
                keyring.delete()?;
                println!("API key removed");
            } else {
                keyring.set(key.as_deref())?;
                if let Some(key) = key {
                    println!("Stored API key {}", mask_key(key.trim()));
                }
            }
        }
        Commands::CheckKey { api_key } => {
            let key = resolve_key(api_key).ok_or("No API key configured")?;
            if validate_api_key(&key).await? {
                println!("API key {} is valid", mask_key(&key));
            } else {
                return Err(format!("API key {} was rejected", mask_key(&key)).into());
            }
        }
        Commands::Playbook {
            product,
            company,
            persona,
            json,
            speak: read_aloud,
        } => {
            let playbook = Playbook::generate(&product, &company, &persona);
            if json {
                println!("{}", serde_json::to_string_pretty(&playbook)?);
            } else {
                print!("{}", playbook);
            }
            if read_aloud {
                speak(&settings, playbook.spoken_summary(), None, true).await?;
            }
        }
    }

    Ok(())
}

fn resolve_voice(query: &str) -> Result<String, Box<dyn Error>> {
    match find_voice(query) {
        Some(voice) => Ok(voice.id.to_string()),
        // Not in the catalog; accept anything that looks like a provider id
        None if is_voice_id(query) => Ok(query.to_string()),
        None => Err(format!("Unknown voice: {}", query).into()),
    }
}

fn resolve_key(flag: Option<String>) -> Option<String> {
    CredentialChain::new()
        .with(StaticCredential::new(flag))
        .with(CredentialChain::standard())
        .api_key()
}

async fn speak(
    settings: &AppSettings,
    text: String,
    api_key: Option<String>,
    retry: bool,
) -> Result<(), Box<dyn Error>> {
    let voice = settings.voice_config();
    let config = settings.player_config();

    let decoder = FormatDecoder::for_output_format(&voice.output_format)?;
    let sink = CpalSink::new()?;
    let connector = WebSocketConnector::new();

    let player = StreamingAudioPlayer::new(Arc::new(connector), Arc::new(decoder), Arc::new(sink))
        .with_config(config);

    let request = SpeakRequest::new(text, resolve_key(api_key)).with_voice(voice);
    let mut handle = if retry {
        player.start_with_retry(request, settings.retry_policy())
    } else {
        player.start(request)
    };

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(PlaybackEvent::SpeakingChanged { speaking, .. }) => {
                    log::debug!("Speaking: {}", speaking);
                }
                Some(PlaybackEvent::Failed(e)) => log::error!("{}", e),
                Some(PlaybackEvent::Finished) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping playback");
                handle.cancel();
            }
        }
    }

    match handle.finish().await? {
        SessionOutcome::Completed(metrics) => {
            log::info!(
                "Played {} chunks ({} ms of audio)",
                metrics.chunks_played,
                metrics.audio_played_ms
            );
        }
        SessionOutcome::Cancelled => println!("Cancelled"),
    }
    Ok(())
}
