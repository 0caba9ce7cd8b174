//! Subscriber command grammar and JSON acknowledgments
//!
//! The command language is line-oriented ASCII, one command per WebSocket
//! text frame. Replies are small JSON objects; the message set is closed, so
//! each reply has its own constructor rather than a generic envelope.

use crate::audio::SourceDescriptor;
use serde::Serialize;
use serde_json::json;

/// A validated subscriber command.
///
/// Parsing is strict: unknown verbs and out-of-set values yield `None`, and
/// the daemon stays silent about them by contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enumerate selectable audio sources.
    GetSources,
    /// Reopen the capture stream on the named source.
    SetSource(String),
    /// Change the bar emission rate.
    SetFps(u32),
    /// Change the upper frequency edge of the spectrum.
    SetFreqMax(u32),
    /// Change the number of bars.
    SetBarCount(usize),
}

impl Command {
    /// Parse one text frame. Returns `None` for anything that is not a
    /// well-formed command with an allowed value.
    pub fn parse(line: &str) -> Option<Self> {
        if line == "GET_SOURCES" {
            return Some(Self::GetSources);
        }
        if let Some(name) = line.strip_prefix("SET_SOURCE:") {
            if name.is_empty() {
                return None;
            }
            return Some(Self::SetSource(name.to_string()));
        }
        if let Some(arg) = line.strip_prefix("SET_FPS:") {
            let fps = arg.parse().ok()?;
            return crate::FPS_CHOICES.contains(&fps).then_some(Self::SetFps(fps));
        }
        if let Some(arg) = line.strip_prefix("SET_FREQ_MAX:") {
            let hz = arg.parse().ok()?;
            return crate::FREQ_MAX_CHOICES
                .contains(&hz)
                .then_some(Self::SetFreqMax(hz));
        }
        if let Some(arg) = line.strip_prefix("SET_BAR_COUNT:") {
            let count = arg.parse().ok()?;
            return crate::BAR_COUNT_CHOICES
                .contains(&count)
                .then_some(Self::SetBarCount(count));
        }
        None
    }
}

/// Source list reply. Serialized directly (not via `Value`) so descriptor
/// fields keep their declaration order on the wire.
#[derive(Serialize)]
struct SourcesReply<'a> {
    sources: &'a [SourceDescriptor],
}

/// `{"sources":[{"name":…,"desc":…},…]}`
pub fn sources_reply(sources: &[SourceDescriptor]) -> String {
    serde_json::to_string(&SourcesReply { sources }).unwrap()
}

/// `{"sourceChanged":"<name>"}`
pub fn source_changed_reply(name: &str) -> String {
    json!({ "sourceChanged": name }).to_string()
}

/// `{"sourceError":"<message>"}`
pub fn source_error_reply(message: &str) -> String {
    json!({ "sourceError": message }).to_string()
}

/// `{"fpsChanged":<n>}`
pub fn fps_changed_reply(fps: u32) -> String {
    json!({ "fpsChanged": fps }).to_string()
}

/// `{"freqMaxChanged":<hz>}`
pub fn freq_max_changed_reply(hz: u32) -> String {
    json!({ "freqMaxChanged": hz }).to_string()
}

/// `{"barCountChanged":<k>}`
pub fn bar_count_changed_reply(count: usize) -> String {
    json!({ "barCountChanged": count }).to_string()
}

/// Encode one bar snapshot as the binary frame payload: little-endian
/// float32, one per bar, ascending frequency.
pub fn encode_bars(bars: &[f32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(bars.len() * 4);
    for &bar in bars {
        payload.extend_from_slice(&bar.to_le_bytes());
    }
    payload
}
