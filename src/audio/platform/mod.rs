//! Platform-specific loopback capture implementations
//!
//! Each platform module provides:
//! - `open_source(name)` - acquire a loopback capture stream
//! - `enumerate_sources()` - list selectable monitor sources
//! - `DEFAULT_SOURCE` / `SOURCE_SELECTION` - platform capture contract

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "windows")]
pub use windows::{enumerate_sources, open_source, DEFAULT_SOURCE, SOURCE_SELECTION};

#[cfg(not(target_os = "windows"))]
pub mod linux;

#[cfg(not(target_os = "windows"))]
pub use linux::{enumerate_sources, open_source, DEFAULT_SOURCE, SOURCE_SELECTION};
