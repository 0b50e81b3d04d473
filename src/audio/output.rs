//! Host audio output driver.
//!
//! Owns the cpal stream, selects devices and stream configs, and rebuilds the
//! stream on device/sample-rate/buffer-size changes without disturbing the
//! mixer's transport state. A replacement stream is opened and verified
//! before the previous one is retired, so a failed switch leaves the old
//! stream running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, warn};

use crate::audio::mixer::{MixerCore, MixerSeed, MixerShared};
use crate::config::CANONICAL_SAMPLE_RATE;
use crate::error::EngineError;

/// How long to wait for the first callback before declaring a device dead.
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Facts about the running output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputStreamInfo {
    pub device_name: String,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    pub buffer_frames: u32,
}

struct ActiveStream {
    // Held for its Drop; dropping stops the host stream.
    _stream: cpal::Stream,
    generation: u64,
    info: OutputStreamInfo,
}

/// Owns the host output stream and the mixer-core handoff across rebuilds.
pub struct OutputDriver {
    shared: Arc<MixerShared>,
    device_lost: Arc<AtomicBool>,
    active: Option<ActiveStream>,
    next_generation: u64,
}

impl OutputDriver {
    /// `device_lost` is shared with the control plane so the event pump can
    /// observe host-signalled device loss without a round trip.
    pub fn new(shared: Arc<MixerShared>, device_lost: Arc<AtomicBool>) -> Self {
        Self {
            shared,
            device_lost,
            active: None,
            next_generation: 1,
        }
    }

    /// Names of all output devices the default host reports.
    pub fn enumerate_devices() -> Vec<String> {
        let host = cpal::default_host();
        let Ok(devices) = host.output_devices() else {
            return Vec::new();
        };
        devices.filter_map(|device| device.name().ok()).collect()
    }

    pub fn current_info(&self) -> Option<&OutputStreamInfo> {
        self.active.as_ref().map(|active| &active.info)
    }

    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(
                "OutputDriver: stream generation {} stopped",
                active.generation
            );
        }
    }

    /// Opens a stream on `device_name` (or the system default) and hands
    /// rendering to a fresh core seeded with `seed`. The previous stream, if
    /// any, keeps running until the new one has produced its first callback;
    /// on failure it is left untouched.
    pub fn open(
        &mut self,
        device_name: Option<&str>,
        requested_sample_rate: u32,
        requested_buffer_frames: u32,
        seed: MixerSeed,
    ) -> Result<OutputStreamInfo, EngineError> {
        let label = device_name.unwrap_or("default").to_string();
        let device = select_device(device_name)
            .ok_or_else(|| EngineError::DeviceUnavailable { name: label.clone() })?;

        let configs: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|err| {
                error!("OutputDriver: failed to query configs for {}: {}", label, err);
                EngineError::DeviceUnavailable { name: label.clone() }
            })?
            .collect();

        let selected = choose_best_stream_config(&configs, requested_sample_rate.max(8_000), 2)
            .ok_or_else(|| EngineError::DeviceUnavailable { name: label.clone() })?;
        let sample_format = selected.sample_format();
        let device_rate = selected.sample_rate().0;
        let channel_count = selected.channels();

        let mut stream_config: cpal::StreamConfig = selected.config();
        if requested_buffer_frames > 0 {
            stream_config.buffer_size = cpal::BufferSize::Fixed(requested_buffer_frames);
        }

        let generation = self.next_generation;
        let core = MixerCore::new(self.shared.clone(), generation, seed.clone());
        let callback_observed = Arc::new(AtomicBool::new(false));

        let build = build_stream(
            &device,
            &stream_config,
            sample_format,
            core,
            device_rate,
            channel_count,
            callback_observed.clone(),
            self.device_lost.clone(),
        );
        let stream = match build {
            Ok(stream) => stream,
            Err(err) if requested_buffer_frames > 0 => {
                // Some hosts refuse fixed buffer sizes; retry with default.
                warn!(
                    "OutputDriver: fixed buffer of {} frames rejected ({}), retrying with host default",
                    requested_buffer_frames, err
                );
                stream_config.buffer_size = cpal::BufferSize::Default;
                let core = MixerCore::new(self.shared.clone(), generation, seed);
                build_stream(
                    &device,
                    &stream_config,
                    sample_format,
                    core,
                    device_rate,
                    channel_count,
                    callback_observed.clone(),
                    self.device_lost.clone(),
                )
                .map_err(|err| {
                    error!("OutputDriver: failed to build stream on {}: {}", label, err);
                    EngineError::DeviceUnavailable { name: label.clone() }
                })?
            }
            Err(err) => {
                error!("OutputDriver: failed to build stream on {}: {}", label, err);
                return Err(EngineError::DeviceUnavailable { name: label });
            }
        };

        stream
            .play()
            .map_err(|_| EngineError::DeviceUnavailable { name: label.clone() })?;

        // The old stream keeps rendering until the replacement proves alive.
        let opened_at = Instant::now();
        while !callback_observed.load(Ordering::Relaxed) {
            if opened_at.elapsed() > DEVICE_OPEN_TIMEOUT {
                return Err(EngineError::DeviceUnavailable { name: label });
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let info = OutputStreamInfo {
            device_name: device.name().unwrap_or_else(|_| label.clone()),
            sample_rate_hz: device_rate,
            channel_count,
            buffer_frames: requested_buffer_frames,
        };
        debug!(
            "OutputDriver: stream running on '{}' at {} Hz, {} channels (generation {})",
            info.device_name, info.sample_rate_hz, info.channel_count, generation
        );

        self.shared.activate_generation(generation);
        self.next_generation += 1;
        self.device_lost.store(false, Ordering::Relaxed);
        self.active = Some(ActiveStream {
            _stream: stream,
            generation,
            info: info.clone(),
        });
        Ok(info)
    }
}

fn select_device(device_name: Option<&str>) -> Option<cpal::Device> {
    let host = cpal::default_host();
    let requested = device_name.filter(|name| !name.trim().is_empty());
    if let Some(requested) = requested {
        let found = host.output_devices().ok().and_then(|mut devices| {
            devices.find(|device| device.name().map(|name| name == requested).unwrap_or(false))
        });
        if found.is_some() {
            return found;
        }
        warn!(
            "OutputDriver: requested device '{}' not found, falling back to system default",
            requested
        );
    }
    host.default_output_device()
}

/// Best rate inside `[min_rate, max_rate]` for a requested rate: exact when
/// available, otherwise the nearest common audio rate, otherwise a clamp.
fn choose_sample_rate_in_range(min_rate: u32, max_rate: u32, requested: u32) -> u32 {
    const COMMON_SAMPLE_RATES: [u32; 6] = [44_100, 48_000, 88_200, 96_000, 176_400, 192_000];
    if requested >= min_rate && requested <= max_rate {
        return requested;
    }
    COMMON_SAMPLE_RATES
        .iter()
        .copied()
        .filter(|rate| *rate >= min_rate && *rate <= max_rate)
        .min_by_key(|rate| rate.abs_diff(requested))
        .unwrap_or_else(|| requested.clamp(min_rate, max_rate))
}

fn score_sample_format(sample_format: cpal::SampleFormat) -> u64 {
    match sample_format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I16 => 20,
        cpal::SampleFormat::U16 => 30,
        _ => 200,
    }
}

fn choose_best_stream_config(
    supported_configs: &[cpal::SupportedStreamConfigRange],
    requested_sample_rate: u32,
    requested_channels: u16,
) -> Option<cpal::SupportedStreamConfig> {
    let mut best: Option<(u64, cpal::SupportedStreamConfig)> = None;
    for range in supported_configs {
        let candidate_rate = choose_sample_rate_in_range(
            range.min_sample_rate().0,
            range.max_sample_rate().0,
            requested_sample_rate,
        );
        let candidate = range.with_sample_rate(cpal::SampleRate(candidate_rate));
        let channel_penalty = u64::from(candidate.channels().abs_diff(requested_channels)) * 1_000;
        let sample_rate_penalty = u64::from(candidate.sample_rate().0.abs_diff(requested_sample_rate));
        let score =
            channel_penalty + sample_rate_penalty + score_sample_format(candidate.sample_format());
        match &best {
            Some((best_score, _)) if *best_score <= score => {}
            _ => best = Some((score, candidate)),
        }
    }
    best.map(|(_, candidate)| candidate)
}

/// Callback-side state: the mixer core plus scratch space for rate and
/// channel adaptation. All buffers are sized up front; the callback only
/// reuses them.
struct CallbackState {
    core: MixerCore,
    boundary: Option<BoundaryResampler>,
    stereo_scratch: Vec<f32>,
}

impl CallbackState {
    fn new(core: MixerCore, device_rate: u32) -> Self {
        let boundary = if device_rate == CANONICAL_SAMPLE_RATE {
            None
        } else {
            debug!(
                "OutputDriver: device runs at {} Hz, inserting boundary resampler from {} Hz",
                device_rate, CANONICAL_SAMPLE_RATE
            );
            Some(BoundaryResampler::new(device_rate))
        };
        Self {
            core,
            boundary,
            // Room for unusually large host buffers; grown once if exceeded.
            stereo_scratch: vec![0.0; 16_384 * 2],
        }
    }

    /// Produces `frames` device-rate stereo frames into the scratch buffer
    /// and returns it.
    fn render_stereo(&mut self, frames: usize) -> &[f32] {
        if self.stereo_scratch.len() < frames * 2 {
            self.stereo_scratch.resize(frames * 2, 0.0);
        }
        match self.boundary.as_mut() {
            None => {
                let core = &mut self.core;
                core.render(&mut self.stereo_scratch[..frames * 2]);
            }
            Some(boundary) => {
                let core = &mut self.core;
                boundary.process(frames, &mut self.stereo_scratch[..frames * 2], |buffer| {
                    core.render(buffer)
                });
            }
        }
        &self.stereo_scratch[..frames * 2]
    }
}

/// Copies mixed stereo into a device buffer of arbitrary channel count.
/// Mono devices get the channel average; wider layouts get L/R in the first
/// two channels and silence elsewhere.
fn write_device_buffer<T: Copy, F: FnMut(f32) -> T>(
    output: &mut [T],
    stereo: &[f32],
    channels: usize,
    mut convert: F,
    silence: T,
) {
    if channels == 0 {
        return;
    }
    let frames = output.len() / channels;
    for frame in 0..frames {
        let left = stereo[frame * 2];
        let right = stereo[frame * 2 + 1];
        let base = frame * channels;
        if channels == 1 {
            output[base] = convert((left + right) * 0.5);
            continue;
        }
        output[base] = convert(left);
        output[base + 1] = convert(right);
        for channel in 2..channels {
            output[base + channel] = silence;
        }
    }
}

fn quantize_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn quantize_u16(sample: f32) -> u16 {
    ((sample.clamp(-1.0, 1.0) * 0.5 + 0.5) * u16::MAX as f32).round() as u16
}

#[allow(clippy::too_many_arguments)]
fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    core: MixerCore,
    device_rate: u32,
    channel_count: u16,
    callback_observed: Arc<AtomicBool>,
    device_lost: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let channels = channel_count.max(1) as usize;
    let mut state = CallbackState::new(core, device_rate);
    let error_lost = device_lost.clone();
    let error_callback = move |err: cpal::StreamError| {
        error!("OutputDriver: stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            error_lost.store(true, Ordering::Relaxed);
        }
    };

    match sample_format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            config,
            move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback_observed.store(true, Ordering::Relaxed);
                let frames = output.len() / channels;
                let stereo = state.render_stereo(frames);
                write_device_buffer(output, stereo, channels, |sample| sample, 0.0);
            },
            error_callback,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            config,
            move |output: &mut [i16], _: &cpal::OutputCallbackInfo| {
                callback_observed.store(true, Ordering::Relaxed);
                let frames = output.len() / channels;
                let stereo = state.render_stereo(frames);
                write_device_buffer(output, stereo, channels, quantize_i16, 0);
            },
            error_callback,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_output_stream(
            config,
            move |output: &mut [u16], _: &cpal::OutputCallbackInfo| {
                callback_observed.store(true, Ordering::Relaxed);
                let frames = output.len() / channels;
                let stereo = state.render_stereo(frames);
                write_device_buffer(output, stereo, channels, quantize_u16, u16::MAX / 2 + 1);
            },
            error_callback,
            None,
        ),
        _ => Err(cpal::BuildStreamError::StreamConfigNotSupported),
    }
}

/// First-order interpolating resampler between the canonical rate and the
/// device rate. Decoded data stays canonical; this only adapts the output
/// boundary when the device cannot run at 48 kHz. Linear interpolation keeps
/// the hot path allocation-free; decode-time resampling remains sinc.
struct BoundaryResampler {
    /// Canonical frames advanced per device frame.
    step: f64,
    /// Fractional canonical position past `prev`, in `[0, 1)`.
    phase: f64,
    prev: [f32; 2],
    scratch: Vec<f32>,
}

impl BoundaryResampler {
    fn new(device_rate: u32) -> Self {
        Self {
            step: CANONICAL_SAMPLE_RATE as f64 / device_rate.max(1) as f64,
            phase: 0.0,
            prev: [0.0; 2],
            scratch: vec![0.0; 32_768],
        }
    }

    /// Fills `output` (`frames` device-rate stereo frames), pulling as many
    /// canonical frames as the ratio requires through `render`.
    fn process<F: FnMut(&mut [f32])>(&mut self, frames: usize, output: &mut [f32], mut render: F) {
        let advanced = self.phase + frames as f64 * self.step;
        let needed = advanced.ceil() as usize;
        if self.scratch.len() < needed * 2 {
            self.scratch.resize(needed * 2, 0.0);
        }
        render(&mut self.scratch[..needed * 2]);

        let mut pos = self.phase;
        for frame in 0..frames {
            // Frame 0 of the virtual timeline is `prev`; frame k is
            // scratch[k - 1].
            let lower_index = pos as usize;
            let t = (pos - lower_index as f64) as f32;
            let (lower_l, lower_r) = if lower_index == 0 {
                (self.prev[0], self.prev[1])
            } else {
                (
                    self.scratch[(lower_index - 1) * 2],
                    self.scratch[(lower_index - 1) * 2 + 1],
                )
            };
            let upper_index = lower_index.min(needed - 1);
            let upper_l = self.scratch[upper_index * 2];
            let upper_r = self.scratch[upper_index * 2 + 1];
            output[frame * 2] = lower_l + (upper_l - lower_l) * t;
            output[frame * 2 + 1] = lower_r + (upper_r - lower_r) * t;
            pos += self.step;
        }

        let whole = advanced.floor() as usize;
        if whole > 0 {
            self.prev = [
                self.scratch[(whole - 1) * 2],
                self.scratch[(whole - 1) * 2 + 1],
            ];
        }
        self.phase = advanced - whole as f64;
    }
}
