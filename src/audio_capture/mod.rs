//! Microphone acquisition.
//!
//! cpal streams are not `Send` on every host, so the stream lives on a
//! dedicated thread for as long as the capture is open. Frames of 16 kHz mono
//! `i16` samples are handed to tokio through a bounded channel; when the
//! consumer falls behind, frames are dropped rather than queued.

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::VoiceError;

pub const SAMPLE_RATE: u32 = 16_000;
const FRAME_SAMPLES: usize = 256;

static MIC_HELD: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum AudioCaptureError {
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Microphone is already held by another capture")]
    Busy,
}

impl From<AudioCaptureError> for VoiceError {
    fn from(err: AudioCaptureError) -> Self {
        match err {
            AudioCaptureError::Device(_) | AudioCaptureError::Busy => {
                VoiceError::DeviceAcquisition(err.to_string())
            }
            other => VoiceError::Audio(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Input device name (None = default device)
    pub device_name: Option<String>,
    /// Channel to capture (0-based index)
    pub channel: u16,
    /// Samples per emitted frame
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            channel: 0,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u16,
}

/// Exclusive hold on the physical microphone. Released on drop.
#[derive(Debug)]
pub struct MicLease(());

impl MicLease {
    pub fn acquire() -> Result<Self, AudioCaptureError> {
        MIC_HELD
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| MicLease(()))
            .map_err(|_| AudioCaptureError::Busy)
    }

    pub fn is_held() -> bool {
        MIC_HELD.load(Ordering::Acquire)
    }
}

impl Drop for MicLease {
    fn drop(&mut self) {
        MIC_HELD.store(false, Ordering::Release);
    }
}

/// Turns interleaved device samples into fixed-size 16 kHz mono frames.
///
/// Devices that cannot open at 16 kHz are decimated by picking the nearest
/// source sample; good enough for loudness and speech streaming.
pub struct FrameBuilder {
    channels: usize,
    channel: usize,
    step: f64,
    position: f64,
    frame_samples: usize,
    buffer: Vec<i16>,
}

impl FrameBuilder {
    pub fn new(channels: u16, channel: u16, source_rate: u32, frame_samples: usize) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            channel: usize::from(channel),
            step: f64::from(source_rate) / f64::from(SAMPLE_RATE),
            position: 0.0,
            frame_samples: frame_samples.max(1),
            buffer: Vec::with_capacity(frame_samples),
        }
    }

    /// Feed interleaved samples, calling `emit` for every completed frame
    pub fn push(&mut self, interleaved: &[i16], mut emit: impl FnMut(Vec<i16>)) {
        for frame in interleaved.chunks(self.channels) {
            let Some(&sample) = frame.get(self.channel) else {
                continue;
            };
            let take = self.position <= 0.0;
            if take {
                self.position += self.step;
            }
            self.position -= 1.0;
            if !take {
                continue;
            }
            self.buffer.push(sample);
            if self.buffer.len() >= self.frame_samples {
                let full = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_samples));
                emit(full);
            }
        }
    }
}

/// An open microphone. Dropping it stops the stream and releases the lease.
pub struct MicrophoneCapture {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    device_name: String,
    device_rate: u32,
}

impl MicrophoneCapture {
    pub fn open(
        config: CaptureConfig,
        frames: mpsc::Sender<Vec<i16>>,
    ) -> Result<Self, AudioCaptureError> {
        let lease = MicLease::acquire()?;
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let _lease = lease;
                match start_stream(&config, frames) {
                    Ok((stream, name, rate)) => {
                        let _ = ready_tx.send(Ok((name, rate)));
                        // Blocks until close() or the handle is dropped
                        let _ = stop_rx.recv();
                        drop(stream);
                        log::debug!("Microphone stream closed");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioCaptureError::Stream(format!("Failed to spawn capture thread: {}", e)))?;

        let (device_name, device_rate) = ready_rx
            .recv()
            .map_err(|_| AudioCaptureError::Stream("Capture thread exited during startup".into()))??;

        log::info!("🎙️ Microphone open: '{}' @ {}Hz", device_name, device_rate);
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
            device_name,
            device_rate,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("⚠️ Capture thread panicked");
            }
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn list_devices() -> Result<Vec<AudioDeviceInfo>, AudioCaptureError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
        .input_devices()
        .map_err(|e| AudioCaptureError::Device(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };
        let channel_count = device
            .default_input_config()
            .map(|config| config.channels())
            .unwrap_or(0);
        result.push(AudioDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            channel_count,
        });
    }
    Ok(result)
}

fn find_device(name: Option<&str>) -> Result<Device, AudioCaptureError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioCaptureError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioCaptureError::Device(format!("Device not found: {}", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioCaptureError::Device("No default input device found".into())),
    }
}

fn start_stream(
    config: &CaptureConfig,
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<(CpalStream, String, u32), AudioCaptureError> {
    let device = find_device(config.device_name.as_deref())?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| AudioCaptureError::Config(e.to_string()))?
        .collect();

    // Prefer a native 16kHz mode, otherwise decimate from the default
    let chosen = match supported.iter().find(|range| {
        range.min_sample_rate().0 <= SAMPLE_RATE && range.max_sample_rate().0 >= SAMPLE_RATE
    }) {
        Some(range) => range.clone().with_sample_rate(cpal::SampleRate(SAMPLE_RATE)),
        None => device
            .default_input_config()
            .map_err(|e| AudioCaptureError::Config(e.to_string()))?,
    };

    if config.channel >= chosen.channels() {
        return Err(AudioCaptureError::Config(format!(
            "Selected channel {} is not available (device has {} channels)",
            config.channel,
            chosen.channels()
        )));
    }

    let stream_config = cpal::StreamConfig {
        channels: chosen.channels(),
        sample_rate: chosen.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let rate = stream_config.sample_rate.0;
    log::info!(
        "Audio capture configured: {} channels @ {}Hz (format: {:?})",
        stream_config.channels,
        rate,
        chosen.sample_format()
    );

    let builder = FrameBuilder::new(
        stream_config.channels,
        config.channel,
        rate,
        config.frame_samples,
    );
    let stream = match chosen.sample_format() {
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, builder, frames)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, builder, frames)?,
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, builder, frames)?,
        format => {
            return Err(AudioCaptureError::Config(format!(
                "Unsupported sample format: {:?}",
                format
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AudioCaptureError::Stream(e.to_string()))?;
    Ok((stream, name, rate))
}

fn build_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    mut builder: FrameBuilder,
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<CpalStream, AudioCaptureError>
where
    T: Sample + SizedSample + Send + Sync + 'static,
    i16: FromSample<T>,
{
    let mut converted = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                converted.clear();
                converted.extend(data.iter().map(|sample| i16::from_sample(*sample)));
                builder.push(&converted, |frame| {
                    if frames.try_send(frame).is_err() {
                        log::trace!("Capture consumer behind, frame dropped");
                    }
                });
            },
            |err| log::error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| AudioCaptureError::Stream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(builder: &mut FrameBuilder, input: &[i16]) -> Vec<Vec<i16>> {
        let mut out = Vec::new();
        builder.push(input, |frame| out.push(frame));
        out
    }

    #[test]
    fn test_native_rate_passes_samples_through() {
        let mut builder = FrameBuilder::new(1, 0, SAMPLE_RATE, 4);
        let frames = collect(&mut builder, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(frames, vec![vec![1, 2, 3, 4]]);
        let frames = collect(&mut builder, &[7, 8]);
        assert_eq!(frames, vec![vec![5, 6, 7, 8]]);
    }

    #[test]
    fn test_selects_channel_from_interleaved_input() {
        let mut builder = FrameBuilder::new(2, 1, SAMPLE_RATE, 3);
        let frames = collect(&mut builder, &[10, -1, 20, -2, 30, -3]);
        assert_eq!(frames, vec![vec![-1, -2, -3]]);
    }

    #[test]
    fn test_decimates_48k_to_16k() {
        let mut builder = FrameBuilder::new(1, 0, 48_000, 4);
        let input: Vec<i16> = (0..12).collect();
        let frames = collect(&mut builder, &input);
        assert_eq!(frames, vec![vec![0, 3, 6, 9]]);
    }

    #[test]
    fn test_mic_lease_is_exclusive() {
        let lease = MicLease::acquire().unwrap();
        assert!(MicLease::is_held());
        assert!(matches!(MicLease::acquire(), Err(AudioCaptureError::Busy)));
        drop(lease);
        let again = MicLease::acquire();
        assert!(again.is_ok());
    }
}
