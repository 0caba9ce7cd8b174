//! PulseAudio/PipeWire loopback capture
//!
//! Capture runs through `parec`, the PulseAudio record client: it attaches
//! to any named source (including `@DEFAULT_MONITOR@`, resolved server-side)
//! and writes raw samples to stdout, which gives the blocking frame-read
//! semantics the main loop is clocked by. Enumeration shells out to `pactl`,
//! which works with both PulseAudio and PipeWire via pipewire-pulse.

use crate::audio::{AudioSource, CaptureError, SourceDescriptor, SAMPLE_RATE};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

/// The server-side alias for "monitor of the default sink".
pub const DEFAULT_SOURCE: &str = "@DEFAULT_MONITOR@";

/// PulseAudio exposes named monitor sources, so `SET_SOURCE` can reopen.
pub const SOURCE_SELECTION: bool = true;

/// How long a freshly spawned `parec` gets to fail before the stream is
/// considered open. Connection errors (bad source name, no daemon) surface
/// as an immediate child exit.
const SPAWN_PROBE: Duration = Duration::from_millis(200);

/// Monitor-of-sink capture stream backed by a `parec` child process.
pub struct PulseMonitorSource {
    child: Child,
    stdout: ChildStdout,
    source_name: String,
    byte_buf: Vec<u8>,
}

/// Acquire a capture stream on the named monitor source.
pub fn open_source(name: &str) -> Result<Box<dyn AudioSource>, CaptureError> {
    let (child, stdout) = spawn_parec(name)?;
    Ok(Box::new(PulseMonitorSource {
        child,
        stdout,
        source_name: name.to_string(),
        byte_buf: Vec::new(),
    }))
}

fn spawn_parec(name: &str) -> Result<(Child, ChildStdout), CaptureError> {
    let mut child = Command::new("parec")
        .arg("--format=float32le")
        .arg(format!("--rate={SAMPLE_RATE}"))
        .arg("--channels=1")
        .arg(format!("--device={name}"))
        .arg("--client-name=vis-capture")
        .arg("--latency-msec=20")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CaptureError::SourceUnavailable(format!("parec: {e}")))?;

    // parec reports a bad source or a missing daemon by exiting right away;
    // give it a short window before trusting the stream.
    let deadline = std::time::Instant::now() + SPAWN_PROBE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut detail = String::new();
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut detail);
                }
                let detail = detail.trim();
                return Err(CaptureError::SourceUnavailable(if detail.is_empty() {
                    format!("parec exited with {status}")
                } else {
                    detail.to_string()
                }));
            }
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(CaptureError::SourceUnavailable(e.to_string())),
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::SourceUnavailable("parec stdout not captured".into()))?;
    log::info!("PulseAudio capture connected to: {name}");
    Ok((child, stdout))
}

impl AudioSource for PulseMonitorSource {
    fn read_frame(&mut self, out: &mut [f32]) -> Result<(), CaptureError> {
        self.byte_buf.resize(out.len() * 4, 0);
        self.stdout
            .read_exact(&mut self.byte_buf)
            .map_err(|e| CaptureError::SourceLost(format!("parec read: {e}")))?;
        for (sample, chunk) in out.iter_mut().zip(self.byte_buf.chunks_exact(4)) {
            *sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CaptureError> {
        // parec has no flush; a fresh child starts on live audio, which is
        // exactly what a reconnecting subscriber should hear.
        let _ = self.child.kill();
        let _ = self.child.wait();
        let (child, stdout) = spawn_parec(&self.source_name)
            .map_err(|e| CaptureError::SourceLost(e.to_string()))?;
        self.child = child;
        self.stdout = stdout;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.source_name
    }
}

impl Drop for PulseMonitorSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// List monitor sources via `pactl list sources`.
///
/// Only sources that monitor a sink are returned; microphones and other
/// plain capture endpoints are filtered out.
pub fn enumerate_sources() -> Vec<SourceDescriptor> {
    let output = match Command::new("pactl").args(["list", "sources"]).output() {
        Ok(out) if out.status.success() => out,
        Ok(_) | Err(_) => {
            log::warn!("pactl not available, source enumeration disabled");
            return Vec::new();
        }
    };

    parse_pactl_sources(&String::from_utf8_lossy(&output.stdout))
}

fn parse_pactl_sources(listing: &str) -> Vec<SourceDescriptor> {
    let mut sources = Vec::new();
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut monitor_of: Option<String> = None;

    let mut push = |name: &mut Option<String>,
                    description: &mut Option<String>,
                    monitor_of: &mut Option<String>| {
        if let (Some(n), Some(m)) = (name.take(), monitor_of.take()) {
            if m != "n/a" {
                let desc = description.take().unwrap_or_else(|| n.clone());
                sources.push(SourceDescriptor::new(n, desc));
            }
        }
        *description = None;
        *monitor_of = None;
    };

    for line in listing.lines() {
        let line = line.trim();
        if line.starts_with("Source #") {
            push(&mut name, &mut description, &mut monitor_of);
        } else if let Some(rest) = line.strip_prefix("Name: ") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Description: ") {
            description = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Monitor of Sink: ") {
            monitor_of = Some(rest.trim().to_string());
        }
    }
    push(&mut name, &mut description, &mut monitor_of);

    sources
}
