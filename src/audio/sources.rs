//! Audio source enumeration

use serde::Serialize;

/// A selectable capture endpoint, as reported to the subscriber.
///
/// Field order matters: `GET_SOURCES` replies serialize these verbatim and
/// the renderer expects `name` before `desc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    /// Internal source name, passed back in `SET_SOURCE`.
    pub name: String,

    /// Human-readable description.
    #[serde(rename = "desc")]
    pub description: String,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// List selectable loopback sources.
///
/// On platforms whose audio API has no per-source selection this returns a
/// single synthetic entry describing the default render device.
pub fn list_sources() -> Vec<SourceDescriptor> {
    super::platform::enumerate_sources()
}
