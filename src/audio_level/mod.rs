//! Audio Level Sampler
//!
//! Turns raw microphone samples into a normalized loudness signal. The
//! spectrum is computed with a Hann-windowed real FFT and mapped onto a
//! byte-style decibel scale, so a level of `1.0` means every bin sits at
//! `max_decibels` and `0.0` means every bin is at or below `min_decibels`.

use crate::config::SamplerConfig;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// One loudness observation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelSample {
    /// Mean normalized bin energy in `[0, 1]`
    pub level: f32,
    /// Max minus min normalized bin energy in `[0, 1]`
    pub spread: f32,
}

impl LevelSample {
    pub fn new(level: f32, spread: f32) -> Self {
        Self {
            level: level.clamp(0.0, 1.0),
            spread: spread.clamp(0.0, 1.0),
        }
    }

    /// Loudness reported during an input gap
    pub fn silent() -> Self {
        Self::default()
    }
}

pub struct AudioLevelSampler {
    config: SamplerConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    // Smoothed linear magnitudes, reused across samples
    bins: Vec<f32>,
    fresh: bool,
    last_emit: Option<Instant>,
    last: LevelSample,
}

impl AudioLevelSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let fft_size = config.fft_size.max(32);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let bins = vec![0.0; spectrum.len()];

        log::debug!(
            "🎚️ Level sampler ready: fft_size={}, interval={:?}, smoothing={:.2}",
            fft_size,
            config.interval,
            config.smoothing
        );

        Self {
            config,
            fft,
            window,
            history: VecDeque::with_capacity(fft_size),
            input,
            spectrum,
            bins,
            fresh: false,
            last_emit: None,
            last: LevelSample::silent(),
        }
    }

    /// Feed captured 16-bit samples; only the most recent window is kept.
    pub fn push_samples(&mut self, samples: &[i16]) {
        let capacity = self.window.len();
        for &sample in samples {
            if self.history.len() == capacity {
                self.history.pop_front();
            }
            self.history.push_back(sample as f32 / 32768.0);
        }
        if !samples.is_empty() {
            self.fresh = true;
        }
    }

    /// Produce a level sample if the throttle interval has passed.
    ///
    /// During an input gap (no samples since the previous emission) the
    /// sampler reports silence rather than failing.
    pub fn sample(&mut self, now: Instant) -> Option<LevelSample> {
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.config.interval {
                return None;
            }
        }
        self.last_emit = Some(now);

        if !self.fresh {
            self.last = LevelSample::silent();
            return Some(self.last);
        }
        self.fresh = false;

        match self.analyze() {
            Some(sample) => self.last = sample,
            None => log::warn!("⚠️ Level analysis failed, reusing last level"),
        }
        Some(self.last)
    }

    fn analyze(&mut self) -> Option<LevelSample> {
        let size = self.window.len();
        let offset = size - self.history.len();
        for (i, slot) in self.input.iter_mut().enumerate() {
            let raw = if i < offset { 0.0 } else { self.history[i - offset] };
            *slot = raw * self.window[i];
        }

        self.fft.process(&mut self.input, &mut self.spectrum).ok()?;

        let smoothing = self.config.smoothing.clamp(0.0, 0.99);
        let range = (self.config.max_decibels - self.config.min_decibels).max(f32::EPSILON);
        let mut sum = 0.0;
        let mut min = f32::MAX;
        let mut max = f32::MIN;

        for (bin, value) in self.bins.iter_mut().zip(self.spectrum.iter()) {
            let magnitude = value.norm() / size as f32;
            *bin = smoothing * *bin + (1.0 - smoothing) * magnitude;

            let decibels = if *bin > 0.0 {
                20.0 * bin.log10()
            } else {
                self.config.min_decibels
            };
            let normalized = ((decibels - self.config.min_decibels) / range).clamp(0.0, 1.0);

            sum += normalized;
            min = min.min(normalized);
            max = max.max(normalized);
        }

        let count = self.bins.len().max(1) as f32;
        Some(LevelSample::new(sum / count, (max - min).max(0.0)))
    }
}
