//! Built-in provider voices

use serde::Serialize;

/// Rachel
pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Voice {
    pub id: &'static str,
    pub name: &'static str,
}

pub const DEFAULT_VOICES: &[Voice] = &[
    Voice {
        id: DEFAULT_VOICE_ID,
        name: "Rachel",
    },
    Voice {
        id: "AZnzlk1XvdvUeBnXmlld",
        name: "Domi",
    },
    Voice {
        id: "EXAVITQu4vr4xnSDxMaL",
        name: "Sarah",
    },
    Voice {
        id: "MF3mGyEYCl7XYWbV9V6O",
        name: "Elli",
    },
    Voice {
        id: "TxGEqnHWrfWFTfGW9XjX",
        name: "Josh",
    },
    Voice {
        id: "VR6AewLTigWG4xSOukaG",
        name: "Arnold",
    },
    Voice {
        id: "yoZ06aMxZJJ28mfd3POQ",
        name: "Sam",
    },
];

pub fn default_voice() -> Voice {
    DEFAULT_VOICES[0]
}

/// Look up a voice by id or (case-insensitive) name
pub fn find_voice(query: &str) -> Option<Voice> {
    let query = query.trim();
    DEFAULT_VOICES
        .iter()
        .copied()
        .find(|v| v.id == query || v.name.eq_ignore_ascii_case(query))
}

/// The named voice, or the default if it is not in the catalog
pub fn voice_or_default(query: &str) -> Voice {
    find_voice(query).unwrap_or_else(|| {
        log::warn!("Unknown voice {:?}, using {}", query, default_voice().name);
        default_voice()
    })
}

/// Provider voice ids are 20 ASCII alphanumerics
pub fn is_voice_id(s: &str) -> bool {
    s.len() == 20 && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Voice id for a saved selection
///
/// Catalog voices match by id or name and raw provider ids pass through.
/// Anything else falls back to the default voice.
pub fn voice_id_or_default(query: &str) -> String {
    let query = query.trim();
    if find_voice(query).is_none() && is_voice_id(query) {
        return query.to_string();
    }
    voice_or_default(query).id.to_string()
}
