//! WASAPI loopback capture
//!
//! Builds a cpal input stream on the default *render* device, which WASAPI
//! exposes in shared loopback mode: the stream delivers whatever the system
//! is playing. The stream callback downmixes to mono and hands samples to
//! the main loop over a bounded channel; silent packets arrive as zeroed
//! samples. WASAPI loopback always follows the default output, so there is
//! no per-source selection on this platform.

use crate::audio::{AudioSource, CaptureError, SourceDescriptor, SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// Synthetic name for the only capture target on this platform.
pub const DEFAULT_SOURCE: &str = "default";

/// Loopback follows the default render device; `SET_SOURCE` is a no-op ack.
pub const SOURCE_SELECTION: bool = false;

/// Callback-to-main-loop buffer, in samples (about two seconds). While no
/// subscriber is reading, the callback drops overflow instead of blocking.
const CHANNEL_CAPACITY: usize = SAMPLE_RATE as usize * 2;

/// Loopback capture stream on the default render endpoint.
pub struct WasapiLoopbackSource {
    _stream: Stream,
    rx: Receiver<f32>,
    source_name: String,
}

/// Open the default render device in shared loopback mode. The source name
/// is ignored: WASAPI loopback has exactly one capture target.
pub fn open_source(_name: &str) -> Result<Box<dyn AudioSource>, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| CaptureError::SourceUnavailable("no default output device".into()))?;

    // Loopback streams use the render mix format as-is.
    let config = device
        .default_output_config()
        .map_err(|e| CaptureError::SourceUnavailable(format!("loopback config: {e}")))?;

    let channels = config.channels() as usize;
    log::info!(
        "WASAPI loopback: {} Hz, {} channels",
        config.sample_rate().0,
        channels
    );

    let (tx, rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config.into(), tx, channels),
        SampleFormat::I16 => build_stream::<i16>(&device, &config.into(), tx, channels),
        SampleFormat::U16 => build_stream::<u16>(&device, &config.into(), tx, channels),
        other => {
            return Err(CaptureError::SourceUnavailable(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(|e| CaptureError::SourceUnavailable(format!("build stream: {e}")))?;

    stream
        .play()
        .map_err(|e| CaptureError::SourceUnavailable(format!("start stream: {e}")))?;

    Ok(Box::new(WasapiLoopbackSource {
        _stream: stream,
        rx,
        source_name: DEFAULT_SOURCE.to_string(),
    }))
}

/// Build an input stream for the given sample type, downmixing to mono.
fn build_stream<T: cpal::SizedSample>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: Sender<f32>,
    channels: usize,
) -> Result<Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let sum: f32 = frame
                    .iter()
                    .map(|s| -> f32 { cpal::Sample::from_sample(*s) })
                    .sum();
                // Overflow means nobody is reading; dropping is fine.
                let _ = tx.try_send(sum / channels as f32);
            }
        },
        |err| {
            log::error!("loopback stream error: {err}");
        },
        None,
    )
}

impl AudioSource for WasapiLoopbackSource {
    fn read_frame(&mut self, out: &mut [f32]) -> Result<(), CaptureError> {
        for sample in out.iter_mut() {
            *sample = self
                .rx
                .recv()
                .map_err(|_| CaptureError::SourceLost("loopback stream stopped".into()))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CaptureError> {
        loop {
            match self.rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(CaptureError::SourceLost("loopback stream stopped".into()))
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.source_name
    }
}

/// WASAPI loopback has no selectable sources; report one synthetic entry so
/// the renderer's source picker knows there is nothing to choose.
pub fn enumerate_sources() -> Vec<SourceDescriptor> {
    vec![SourceDescriptor::new(
        DEFAULT_SOURCE,
        "Default Audio Output (WASAPI Loopback)",
    )]
}
