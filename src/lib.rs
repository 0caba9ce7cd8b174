//! vis-capture library
//!
//! Captures the operating system's playback mix, runs a sliding-window FFT
//! with cava-style post-processing, and streams bar snapshots to a single
//! local WebSocket subscriber. The binary in `main.rs` wires the pieces
//! together; everything else lives here so tests can drive it directly.

pub mod audio;
pub mod protocol;

/// WebSocket listen port. The browser side connects to ws://127.0.0.1:7700.
pub const WS_PORT: u16 = 7700;

/// Bar counts the subscriber may request.
pub const BAR_COUNT_CHOICES: [usize; 7] = [8, 16, 24, 36, 72, 100, 144];

/// Emission rates the subscriber may request.
pub const FPS_CHOICES: [u32; 3] = [24, 30, 60];

/// Upper frequency ceilings the subscriber may request, in Hz.
pub const FREQ_MAX_CHOICES: [u32; 5] = [10_000, 12_000, 14_000, 16_000, 18_000];

/// Bar count on startup and after processor reinitialization.
pub const DEFAULT_BAR_COUNT: usize = 72;

/// Emission rate on startup.
pub const DEFAULT_FPS: u32 = 30;

/// Frequency ceiling on startup, in Hz.
pub const DEFAULT_FREQ_MAX: u32 = 12_000;
