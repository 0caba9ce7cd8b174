//! Audio capture and analysis module

pub mod fft;
pub mod platform;
pub mod sources;

pub use fft::SpectrumProcessor;
pub use sources::SourceDescriptor;

use thiserror::Error;

/// Capture sample rate in Hz. Loopback streams are opened (or converted) to
/// mono float32 at this rate.
pub const SAMPLE_RATE: u32 = 44_100;

/// Samples per audio frame: exactly one 60 Hz tick of real audio.
pub const FRAME_SIZE: usize = (SAMPLE_RATE / 60) as usize; // 735

/// FFT window length. Must stay a power of two and larger than FRAME_SIZE.
pub const FFT_SIZE: usize = 4096;

/// Lower edge of the analyzed spectrum, in Hz.
pub const FREQ_MIN: f32 = 50.0;

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("source lost: {0}")]
    SourceLost(String),
}

/// A live loopback capture stream delivering mono float32 frames.
///
/// Opening and enumeration are platform free functions (see [`platform`]);
/// dropping the handle releases the stream.
pub trait AudioSource {
    /// Block until exactly `out.len()` fresh samples have been written.
    fn read_frame(&mut self, out: &mut [f32]) -> Result<(), CaptureError>;

    /// Discard buffered audio so the next read delivers fresh data.
    fn flush(&mut self) -> Result<(), CaptureError>;

    /// The source name this stream was opened with.
    fn name(&self) -> &str;
}
