//! Sliding-window FFT processor: log-frequency binning, per-bar EQ,
//! auto-sensitivity, and gravity smoothing tuned to match cava-style bars.

use super::{FFT_SIZE, FRAME_SIZE, FREQ_MIN, SAMPLE_RATE};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Per-frame fall acceleration for the gravity stage.
const GRAVITY: f32 = 0.08;

/// Exponential decay applied to a bar's smoothing memory while falling.
const DECAY: f32 = 0.77;

/// Frames with an absolute peak below this are treated as silence, so
/// sub-16-bit float noise cannot drift the gain upward.
const SILENCE_FLOOR: f32 = 1e-4;

/// Attenuation applied to `sens` on any overshoot.
const SENS_ATTACK: f32 = 0.98;

/// Slow growth applied to `sens` on every non-silent frame.
const SENS_RELEASE: f32 = 1.001;

/// Fast ramp multiplier while `init_mode` is active.
const INIT_RAMP: f32 = 1.1;

/// The ramp stops (and `init_mode` clears) once it would push `sens` past
/// this ceiling.
const INIT_CEILING: f32 = 2.0;

/// Frame peak required before the init ramp engages.
const INIT_AUDIO_FLOOR: f32 = 0.005;

const SENS_MIN: f32 = 0.02;
const SENS_MAX: f32 = 20.0;

/// Spectrum processor for audio visualization.
///
/// One instance is owned by the main loop; reconfiguring the bar count or
/// frequency ceiling rebuilds the lookup tables and resets all dynamic state.
pub struct SpectrumProcessor {
    bar_count: usize,
    freq_max: f32,

    fft: Arc<dyn Fft<f32>>,
    fft_buf: Vec<Complex<f32>>,

    // Sliding window of the last FFT_SIZE samples and its Hann weights
    window: Vec<f32>,
    hann: Vec<f32>,

    // Per-bar bin cutoffs (inclusive) and EQ weights
    bin_lo: Vec<usize>,
    bin_hi: Vec<usize>,
    eq: Vec<f32>,

    // Per-bar dynamic state
    mem: Vec<f32>,      // smoothing memory (instant attack, exponential fall)
    peak: Vec<f32>,     // gravity-tracked peak
    fall: Vec<f32>,     // per-bar fall velocity
    bars: Vec<f32>,     // clamped output of the last step

    // Global auto-sensitivity
    sens: f32,
    init_mode: bool,
}

impl SpectrumProcessor {
    /// Create a processor for `bar_count` bars spanning FREQ_MIN..`freq_max` Hz.
    pub fn new(bar_count: usize, freq_max: u32) -> Self {
        let hann: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE - 1) as f32).cos())
            })
            .collect();

        let mut p = Self {
            bar_count,
            freq_max: freq_max as f32,
            fft: FftPlanner::new().plan_fft_forward(FFT_SIZE),
            fft_buf: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            window: vec![0.0; FFT_SIZE],
            hann,
            bin_lo: Vec::new(),
            bin_hi: Vec::new(),
            eq: Vec::new(),
            mem: Vec::new(),
            peak: Vec::new(),
            fall: Vec::new(),
            bars: Vec::new(),
            sens: 1.0,
            init_mode: true,
        };
        p.rebuild_tables();
        p.reset();
        p
    }

    /// Active bar count.
    pub fn bar_count(&self) -> usize {
        self.bar_count
    }

    /// Resize the output vector and reinitialize.
    pub fn set_bar_count(&mut self, bar_count: usize) {
        self.bar_count = bar_count;
        self.rebuild_tables();
        self.reset();
    }

    /// Change the upper frequency edge and reinitialize.
    pub fn set_freq_max(&mut self, freq_max: u32) {
        self.freq_max = freq_max as f32;
        self.rebuild_tables();
        self.reset();
    }

    /// Zero all dynamic state. Called on reconfiguration and whenever the
    /// subscriber reconnects, so stale audio never leaks into a session.
    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.mem.fill(0.0);
        self.peak.fill(0.0);
        self.fall.fill(0.0);
        self.bars.fill(0.0);
        self.sens = 1.0;
        self.init_mode = true;
    }

    /// Process one frame of FRAME_SIZE fresh samples and return the bar
    /// vector, each value in [0, 1], ordered low to high frequency.
    pub fn step(&mut self, frame: &[f32]) -> &[f32] {
        debug_assert_eq!(frame.len(), FRAME_SIZE);

        // Slide the window left by one frame, append the new audio
        self.window.copy_within(FRAME_SIZE.., 0);
        self.window[FFT_SIZE - FRAME_SIZE..].copy_from_slice(frame);

        let audio_max = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let silent = audio_max < SILENCE_FLOOR;

        // Hann window across the full buffer, then forward FFT
        for (out, (&s, &w)) in self
            .fft_buf
            .iter_mut()
            .zip(self.window.iter().zip(self.hann.iter()))
        {
            *out = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let half = (FFT_SIZE / 2) as f32;
        let mut overshoot = false;

        for b in 0..self.bar_count {
            let (lo, hi) = (self.bin_lo[b], self.bin_hi[b]);
            let sum: f32 = self.fft_buf[lo..=hi].iter().map(|c| c.norm()).sum();
            let avg = sum / (hi - lo + 1) as f32;

            // sqrt gives perceptual compression; EQ lifts the high bars
            let raw = (avg / half).sqrt() * self.eq[b] * self.sens;

            // Instant attack, exponential fall. Gain 1 keeps the smoothed
            // value at or below the raw input, so decay is guaranteed.
            if raw > self.mem[b] {
                self.mem[b] = raw;
            } else {
                self.mem[b] *= DECAY;
            }

            // Gravity: peaks fall with accelerating velocity
            if self.mem[b] >= self.peak[b] {
                self.peak[b] = self.mem[b];
                self.fall[b] = 0.0;
            } else {
                self.peak[b] -= GRAVITY * self.fall[b];
                self.fall[b] += GRAVITY;
                if self.peak[b] < self.mem[b] {
                    self.peak[b] = self.mem[b];
                }
                if self.peak[b] < 0.0 {
                    self.peak[b] = 0.0;
                }
            }

            if self.peak[b] > 1.0 {
                overshoot = true;
            }
            self.bars[b] = self.peak[b].min(1.0);
        }

        // Auto-sensitivity: shrink fast when any bar clips, grow slowly
        // while signal is present. Silence leaves the gain untouched.
        if overshoot {
            self.sens *= SENS_ATTACK;
            self.init_mode = false;
        } else if !silent {
            self.sens *= SENS_RELEASE;
            if self.init_mode && audio_max > INIT_AUDIO_FLOOR {
                if self.sens * INIT_RAMP < INIT_CEILING {
                    self.sens *= INIT_RAMP;
                } else {
                    self.init_mode = false;
                }
            }
        }
        self.sens = self.sens.clamp(SENS_MIN, SENS_MAX);

        &self.bars
    }

    /// Rebuild bin cutoffs and EQ weights for the current bar count and
    /// frequency ceiling.
    ///
    /// N+1 log-spaced boundary frequencies from FREQ_MIN to freq_max are
    /// converted to FFT bin indices; each cutoff is pushed up to at least
    /// one past its predecessor so every bar owns at least one unique bin.
    fn rebuild_tables(&mut self) {
        let n = self.bar_count;
        let nyquist_bin = FFT_SIZE / 2 - 1;
        let ratio = self.freq_max / FREQ_MIN;

        let mut cutoffs = vec![0usize; n + 1];
        let mut prev = 0usize;
        for (i, cut) in cutoffs.iter_mut().enumerate() {
            let freq = FREQ_MIN * ratio.powf(i as f32 / n as f32);
            let mut bin = (freq * FFT_SIZE as f32 / SAMPLE_RATE as f32) as usize;
            bin = bin.clamp(1, nyquist_bin);
            if i > 0 && bin <= prev {
                bin = prev + 1;
            }
            *cut = bin;
            prev = bin;
        }

        self.bin_lo = cutoffs[..n].to_vec();
        self.bin_hi = cutoffs[1..].to_vec();

        self.eq = (0..n)
            .map(|b| {
                let center = FREQ_MIN * ratio.powf((b as f32 + 0.5) / n as f32);
                (center / FREQ_MIN).sqrt()
            })
            .collect();

        self.mem = vec![0.0; n];
        self.peak = vec![0.0; n];
        self.fall = vec![0.0; n];
        self.bars = vec![0.0; n];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic white-noise-like generator (xorshift32).
    struct Noise(u32);

    impl Noise {
        fn next(&mut self) -> f32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            (x as f32 / u32::MAX as f32) * 2.0 - 1.0
        }

        fn frame(&mut self, amplitude: f32) -> Vec<f32> {
            (0..FRAME_SIZE).map(|_| self.next() * amplitude).collect()
        }
    }

    fn sine_frame(freq: f32, amplitude: f32, start_sample: usize) -> Vec<f32> {
        (0..FRAME_SIZE)
            .map(|i| {
                let t = (start_sample + i) as f32 / SAMPLE_RATE as f32;
                amplitude * (2.0 * std::f32::consts::PI * freq * t).sin()
            })
            .collect()
    }

    /// Index of the bar whose frequency range contains `freq`.
    fn bar_for_freq(p: &SpectrumProcessor, freq: f32) -> usize {
        let bin = (freq * FFT_SIZE as f32 / SAMPLE_RATE as f32) as usize;
        (0..p.bar_count)
            .find(|&b| p.bin_lo[b] <= bin && bin <= p.bin_hi[b])
            .unwrap_or(p.bar_count - 1)
    }

    #[test]
    fn bars_stay_in_unit_range_under_noise() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        let mut noise = Noise(0x1234_5678);
        for _ in 0..120 {
            let bars = p.step(&noise.frame(0.8));
            for &v in bars {
                assert!((0.0..=1.0).contains(&v), "bar out of range: {v}");
            }
        }
    }

    #[test]
    fn cutoffs_grow_strictly_for_every_configuration() {
        for &bars in &crate::BAR_COUNT_CHOICES {
            for &fmax in &crate::FREQ_MAX_CHOICES {
                let p = SpectrumProcessor::new(bars, fmax);
                for b in 1..bars {
                    assert!(
                        p.bin_lo[b] >= p.bin_lo[b - 1] + 1,
                        "lo not strictly monotonic at bar {b} ({bars} bars, {fmax} Hz)"
                    );
                }
                for b in 0..bars {
                    assert!(p.bin_lo[b] >= 1);
                    assert!(p.bin_lo[b] <= p.bin_hi[b]);
                    assert!(p.bin_hi[b] <= FFT_SIZE / 2 - 1);
                }
            }
        }
    }

    #[test]
    fn densest_configuration_still_has_unique_bins() {
        // 144 bars over 50..10000 Hz is the tightest packing the subscriber
        // can request; the low bars collapse to one bin each.
        let p = SpectrumProcessor::new(144, 10_000);
        for b in 1..144 {
            assert!(p.bin_lo[b] > p.bin_lo[b - 1]);
        }
    }

    #[test]
    fn window_tail_holds_the_latest_frame() {
        let mut p = SpectrumProcessor::new(16, 12_000);
        let mut noise = Noise(42);
        p.step(&noise.frame(0.5));
        let frame = noise.frame(0.5);
        p.step(&frame);
        assert_eq!(&p.window[FFT_SIZE - FRAME_SIZE..], frame.as_slice());
    }

    #[test]
    fn smoothing_never_amplifies() {
        let mut p = SpectrumProcessor::new(36, 12_000);
        let mut noise = Noise(7);
        let mut prev_mem = p.mem.clone();
        for _ in 0..60 {
            let frame = noise.frame(0.4);

            // Recompute raw for this frame the way step() does, from a copy
            // of the pre-step state, then check mem[b] <= max(raw, prev).
            let mut shadow = p.window.clone();
            shadow.copy_within(FRAME_SIZE.., 0);
            shadow[FFT_SIZE - FRAME_SIZE..].copy_from_slice(&frame);
            let mut buf: Vec<Complex<f32>> = shadow
                .iter()
                .zip(p.hann.iter())
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();
            p.fft.process(&mut buf);
            let sens = p.sens;
            let raws: Vec<f32> = (0..p.bar_count)
                .map(|b| {
                    let (lo, hi) = (p.bin_lo[b], p.bin_hi[b]);
                    let sum: f32 = buf[lo..=hi].iter().map(|c| c.norm()).sum();
                    let avg = sum / (hi - lo + 1) as f32;
                    (avg / (FFT_SIZE / 2) as f32).sqrt() * p.eq[b] * sens
                })
                .collect();

            p.step(&frame);
            for b in 0..p.bar_count {
                let bound = raws[b].max(prev_mem[b]) + 1e-6;
                assert!(p.mem[b] <= bound, "mem amplified at bar {b}");
            }
            prev_mem = p.mem.clone();
        }
    }

    #[test]
    fn gravity_peak_bounds_hold() {
        let mut p = SpectrumProcessor::new(24, 12_000);
        let mut noise = Noise(99);
        for i in 0..90 {
            let amp = if i < 30 { 0.7 } else { 0.0 };
            p.step(&noise.frame(amp));
            for b in 0..p.bar_count {
                assert!(p.peak[b] >= p.mem[b] - 1e-6);
                assert!(p.peak[b] >= 0.0);
            }
        }
    }

    #[test]
    fn silence_never_grows_sens() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        let zeros = vec![0.0f32; FRAME_SIZE];
        let before = p.sens;
        for _ in 0..30 {
            p.step(&zeros);
            assert!(p.sens <= before);
        }
        assert!(p.init_mode, "silence must not clear init mode");
    }

    #[test]
    fn quiet_audio_skips_the_init_ramp() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        // Audible but below the 0.005 ramp floor: only the slow growth runs.
        let frame = sine_frame(1_000.0, 0.003, 0);
        p.step(&frame);
        assert!(p.sens <= 1.0 * SENS_RELEASE + 1e-6);
        assert!(p.init_mode);
    }

    #[test]
    fn init_ramp_stops_below_ceiling() {
        let mut p = SpectrumProcessor::new(8, 12_000);
        // Tiny-but-ramping signal: loud enough for the ramp, far too quiet
        // to overshoot, so only the ceiling can clear init mode.
        let mut start = 0;
        for _ in 0..40 {
            let frame = sine_frame(100.0, 0.01, start);
            start += FRAME_SIZE;
            p.step(&frame);
            if !p.init_mode {
                break;
            }
        }
        assert!(!p.init_mode, "ramp never reached the ceiling");
        assert!(p.sens < INIT_CEILING);
    }

    #[test]
    fn sens_stays_clamped() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        let mut noise = Noise(3);
        for i in 0..600 {
            let amp = if i % 2 == 0 { 1.0 } else { 0.0 };
            p.step(&noise.frame(amp));
            assert!((SENS_MIN..=SENS_MAX).contains(&p.sens));
        }
    }

    #[test]
    fn sustained_noise_overshoots_then_attenuates() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        let mut noise = Noise(0xDEAD_BEEF);
        let mut overshot_at = None;
        let mut sens_before = p.sens;
        for i in 0..60 {
            sens_before = p.sens;
            p.step(&noise.frame(0.9));
            if !p.init_mode && p.sens < sens_before {
                overshot_at = Some(i);
                break;
            }
        }
        let i = overshot_at.expect("no overshoot within 60 frames of loud noise");
        assert!(p.sens <= sens_before * SENS_ATTACK + 1e-6, "frame {i}");
    }

    #[test]
    fn reconfiguration_resets_dynamic_state() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        let mut noise = Noise(11);
        for _ in 0..30 {
            p.step(&noise.frame(0.8));
        }
        assert!(p.mem.iter().any(|&m| m > 0.0));

        p.set_bar_count(16);
        assert_eq!(p.bar_count(), 16);
        assert_eq!(p.sens, 1.0);
        assert!(p.init_mode);
        assert!(p.mem.iter().all(|&m| m == 0.0));
        assert!(p.peak.iter().all(|&v| v == 0.0));
        assert!(p.fall.iter().all(|&v| v == 0.0));
        assert!(p.window.iter().all(|&s| s == 0.0));

        for _ in 0..10 {
            p.step(&noise.frame(0.8));
        }
        p.set_freq_max(18_000);
        assert_eq!(p.sens, 1.0);
        assert!(p.mem.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn tone_rises_then_decays_to_silence() {
        let mut p = SpectrumProcessor::new(72, 12_000);
        let mut start = 0;
        let mut last = Vec::new();
        for _ in 0..10 {
            let frame = sine_frame(1_000.0, 0.5, start);
            start += FRAME_SIZE;
            last = p.step(&frame).to_vec();
        }
        let b = bar_for_freq(&p, 1_000.0);
        assert!(last[b] > 0.5, "1 kHz bar too low after tone: {}", last[b]);

        let zeros = vec![0.0f32; FRAME_SIZE];
        for _ in 0..60 {
            last = p.step(&zeros).to_vec();
        }
        assert!(last[b] <= 0.05, "1 kHz bar did not decay: {}", last[b]);
    }

    #[test]
    fn output_length_tracks_bar_count() {
        let mut p = SpectrumProcessor::new(100, 14_000);
        let zeros = vec![0.0f32; FRAME_SIZE];
        assert_eq!(p.step(&zeros).len(), 100);
        p.set_bar_count(8);
        assert_eq!(p.step(&zeros).len(), 8);
    }
}
