//! vis-capture daemon
//!
//! Opens the platform's loopback capture, runs the spectrum processor on
//! every audio frame, and serves bar snapshots to a single WebSocket
//! subscriber on 127.0.0.1:7700. The audio hardware is the clock: the loop
//! blocks only inside `read_frame`, everything else is polled between reads.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use vis_capture::audio::{
    platform, sources, CaptureError, SpectrumProcessor, FFT_SIZE, FRAME_SIZE, SAMPLE_RATE,
};
use vis_capture::protocol::{messages, Command, ServerError, VisServer};
use vis_capture::{DEFAULT_BAR_COUNT, DEFAULT_FPS, DEFAULT_FREQ_MAX, WS_PORT};

/// Sleep between loop iterations while no subscriber is connected.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
enum DaemonError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            log::warn!("could not install signal handler: {e}");
        }
    }

    match run(&running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(running: &AtomicBool) -> Result<(), DaemonError> {
    log::info!("vis-capture audio bridge");
    log::info!(
        "FFT {FFT_SIZE}, {DEFAULT_BAR_COUNT} bars, {SAMPLE_RATE} Hz ({FRAME_SIZE} samples/frame)"
    );

    let mut server = VisServer::start(WS_PORT)?;
    let mut source = platform::open_source(platform::DEFAULT_SOURCE)?;
    let mut processor = SpectrumProcessor::new(DEFAULT_BAR_COUNT, DEFAULT_FREQ_MAX);

    let mut send_interval = Duration::from_millis(u64::from(1000 / DEFAULT_FPS));
    let mut last_send = Instant::now();
    let mut idle = true;
    let mut frame = [0.0f32; FRAME_SIZE];

    log::info!("waiting for client on ws://127.0.0.1:{WS_PORT}");

    while running.load(Ordering::SeqCst) {
        for line in server.poll() {
            let Some(command) = Command::parse(&line) else {
                continue;
            };
            match command {
                Command::GetSources => {
                    let list = sources::list_sources();
                    log::info!("sending {} sources to client", list.len());
                    server.send_text(messages::sources_reply(&list));
                }
                Command::SetSource(name) => {
                    if !platform::SOURCE_SELECTION {
                        // Loopback always follows the default output here;
                        // acknowledge without reopening anything.
                        server.send_text(messages::source_changed_reply(platform::DEFAULT_SOURCE));
                        continue;
                    }
                    if name == source.name() {
                        continue;
                    }
                    log::info!("source change requested: {name}");
                    match platform::open_source(&name) {
                        Ok(new_source) => {
                            source = new_source;
                            processor.reset();
                            server.send_text(messages::source_changed_reply(&name));
                        }
                        Err(e) => {
                            // The previous stream was never closed; keep it.
                            log::warn!("failed to switch source: {e}");
                            server.send_text(messages::source_error_reply(
                                "Failed to connect to source",
                            ));
                        }
                    }
                }
                Command::SetFps(fps) => {
                    send_interval = Duration::from_millis(u64::from(1000 / fps));
                    log::info!("send rate changed to {fps} fps");
                    server.send_text(messages::fps_changed_reply(fps));
                }
                Command::SetFreqMax(hz) => {
                    processor.set_freq_max(hz);
                    log::info!("freq max changed to {hz} Hz");
                    server.send_text(messages::freq_max_changed_reply(hz));
                }
                Command::SetBarCount(count) => {
                    processor.set_bar_count(count);
                    log::info!("bar count changed to {count}");
                    server.send_text(messages::bar_count_changed_reply(count));
                }
            }
        }

        if !server.has_client() {
            idle = true;
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        // Subscriber just appeared: drop stale audio, start a clean session
        if idle {
            source.flush()?;
            processor.reset();
            idle = false;
            last_send = Instant::now();
            log::info!("client connected, streaming");
        }

        // Blocking read of one frame (~16.7 ms); a read error is fatal
        source.read_frame(&mut frame)?;
        let bars = processor.step(&frame);

        if last_send.elapsed() >= send_interval {
            server.send_binary(messages::encode_bars(bars));
            last_send = Instant::now();
        }
    }

    log::info!("shutting down");
    server.stop();
    Ok(())
}
