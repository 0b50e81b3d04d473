//! Stem decode and resample pipeline.
//!
//! Turns one source file into a contiguous interleaved stereo `f32` buffer at
//! the engine's canonical sample rate. Runs on loader worker threads; the
//! whole stem is materialized before it is handed to anyone else, so a failed
//! decode never leaks truncated audio.

use std::path::Path;

use log::{debug, warn};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::CANONICAL_SAMPLE_RATE;
use crate::error::DecodeError;

/// Frames fed to the sinc resampler per chunk. Bounds resampler scratch
/// memory regardless of source length.
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Consecutive undecodable packets tolerated before the stream is declared
/// corrupt.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 50;

/// Decode output: canonical-rate interleaved stereo PCM plus the source
/// format facts the import pipeline also records.
#[derive(Debug, Clone)]
pub struct DecodedStemPcm {
    /// Interleaved stereo samples at the canonical rate.
    pub pcm: Vec<f32>,
    pub frames: u64,
    pub native_sample_rate: u32,
    pub native_channels: u16,
}

/// Decodes one audio file to canonical-rate stereo PCM.
pub fn decode_stem_file(path: &Path) -> Result<DecodedStemPcm, DecodeError> {
    if !path.is_file() {
        return Err(DecodeError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let file = std::fs::File::open(path).map_err(|err| DecodeError::Io {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    let media_source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| {
            debug!("StemDecoder: probe failed for {}: {}", path.display(), err);
            DecodeError::UnsupportedFormat {
                path: path.to_path_buf(),
            }
        })?;
    let mut format_reader = probed.format;

    let (source_track_id, codec_params) = {
        let track = format_reader
            .default_track()
            .ok_or_else(|| DecodeError::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;
        (track.id, track.codec_params.clone())
    };

    let native_sample_rate =
        codec_params
            .sample_rate
            .ok_or_else(|| DecodeError::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;
    let native_channels = codec_params
        .channels
        .map(|channels| channels.count() as u16)
        .unwrap_or(0);
    if native_channels == 0 {
        return Err(DecodeError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|_| DecodeError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;

    let mut resampler = StemResampler::new(native_sample_rate, path)?;
    let mut consecutive_decode_errors = 0u32;
    let mut decoded_any = false;

    loop {
        match format_reader.next_packet() {
            Ok(packet) => {
                if packet.track_id() != source_track_id {
                    continue;
                }
                match decoder.decode(&packet) {
                    Ok(decoded) => {
                        consecutive_decode_errors = 0;
                        decoded_any = true;
                        let spec = decoded.spec();
                        let mut sample_buffer =
                            SampleBuffer::<f32>::new(decoded.capacity() as u64, *spec);
                        sample_buffer.copy_interleaved_ref(decoded);
                        let stereo = to_stereo(sample_buffer.samples(), native_channels as usize);
                        resampler.push(&stereo)?;
                    }
                    Err(Error::DecodeError(msg)) => {
                        warn!(
                            "StemDecoder: skipping undecodable packet in {}: {}",
                            path.display(),
                            msg
                        );
                        consecutive_decode_errors += 1;
                        if consecutive_decode_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                            return Err(DecodeError::CorruptStream {
                                path: path.to_path_buf(),
                                detail: format!(
                                    "{} consecutive packet decode failures",
                                    consecutive_decode_errors
                                ),
                            });
                        }
                    }
                    Err(Error::ResetRequired) => {
                        decoder = symphonia::default::get_codecs()
                            .make(&codec_params, &DecoderOptions::default())
                            .map_err(|err| DecodeError::CorruptStream {
                                path: path.to_path_buf(),
                                detail: format!("decoder reset failed: {err}"),
                            })?;
                    }
                    Err(err) => {
                        return Err(DecodeError::CorruptStream {
                            path: path.to_path_buf(),
                            detail: err.to_string(),
                        });
                    }
                }
            }
            // Symphonia signals normal end-of-stream as an UnexpectedEof.
            Err(Error::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(Error::IoError(err)) => {
                return Err(DecodeError::Io {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                });
            }
            Err(err) => {
                return Err(DecodeError::CorruptStream {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                });
            }
        }
    }

    if !decoded_any {
        return Err(DecodeError::CorruptStream {
            path: path.to_path_buf(),
            detail: "stream contained no decodable audio".to_string(),
        });
    }

    let pcm = resampler.finish()?;
    let frames = (pcm.len() / 2) as u64;
    debug!(
        "StemDecoder: decoded {} ({} Hz, {} ch) to {} canonical frames",
        path.display(),
        native_sample_rate,
        native_channels,
        frames
    );
    Ok(DecodedStemPcm {
        pcm,
        frames,
        native_sample_rate,
        native_channels,
    })
}

/// Maps decoded interleaved samples of any channel count onto stereo.
/// Mono is duplicated into both channels; wider layouts are averaged equally
/// into both channels.
fn to_stereo(samples: &[f32], source_channels: usize) -> Vec<f32> {
    match source_channels {
        2 => samples.to_vec(),
        1 => {
            let mut stereo = Vec::with_capacity(samples.len() * 2);
            for sample in samples {
                stereo.push(*sample);
                stereo.push(*sample);
            }
            stereo
        }
        _ => {
            let frame_count = samples.len() / source_channels;
            let mut stereo = Vec::with_capacity(frame_count * 2);
            for frame in samples.chunks_exact(source_channels) {
                let mean = frame.iter().copied().sum::<f32>() / source_channels as f32;
                stereo.push(mean);
                stereo.push(mean);
            }
            stereo
        }
    }
}

/// Chunked canonical-rate conversion for one stem.
///
/// Pass-through when the source is already at the canonical rate; otherwise a
/// sinc resampler fed in fixed-size chunks so memory stays bounded for long
/// stems, with a partial-chunk flush at end of input.
struct StemResampler {
    resampler: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    output: Vec<f32>,
    path: std::path::PathBuf,
}

impl StemResampler {
    fn new(source_sample_rate: u32, path: &Path) -> Result<Self, DecodeError> {
        let resampler = if source_sample_rate == CANONICAL_SAMPLE_RATE {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(
                CANONICAL_SAMPLE_RATE as f64 / source_sample_rate as f64,
                2.0,
                params,
                RESAMPLE_CHUNK_FRAMES,
                2,
            )
            .map_err(|err| DecodeError::CorruptStream {
                path: path.to_path_buf(),
                detail: format!("failed to create resampler: {err}"),
            })?;
            Some(resampler)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
            output: Vec::new(),
            path: path.to_path_buf(),
        })
    }

    /// Appends interleaved stereo samples, resampling full chunks as they
    /// become available.
    fn push(&mut self, stereo: &[f32]) -> Result<(), DecodeError> {
        let Some(resampler) = self.resampler.as_mut() else {
            self.output.extend_from_slice(stereo);
            return Ok(());
        };

        self.pending.extend_from_slice(stereo);
        loop {
            let needed = resampler.input_frames_next() * 2;
            if self.pending.len() < needed {
                return Ok(());
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let waves_in = deinterleave(&chunk);
            let waves_out = resampler
                .process(&waves_in, None)
                .map_err(|err| DecodeError::CorruptStream {
                    path: self.path.clone(),
                    detail: format!("resample failed: {err}"),
                })?;
            interleave_into(&waves_out, &mut self.output);
        }
    }

    /// Drains the partial trailing chunk and flushes the resampler's delay
    /// line, returning the complete canonical-rate buffer.
    fn finish(mut self) -> Result<Vec<f32>, DecodeError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(self.output);
        };

        if !self.pending.is_empty() {
            let waves_in = deinterleave(&self.pending);
            let waves_out = resampler
                .process_partial(Some(&waves_in), None)
                .map_err(|err| DecodeError::CorruptStream {
                    path: self.path.clone(),
                    detail: format!("partial resample failed: {err}"),
                })?;
            interleave_into(&waves_out, &mut self.output);
            self.pending.clear();
        }

        match resampler.process_partial::<&[f32]>(None, None) {
            Ok(flushed) => interleave_into(&flushed, &mut self.output),
            Err(err) => warn!("StemDecoder: resampler flush failed: {}", err),
        }
        Ok(self.output)
    }
}

fn deinterleave(samples: &[f32]) -> Vec<Vec<f32>> {
    let mut deinterleaved = vec![Vec::with_capacity(samples.len() / 2); 2];
    for (i, sample) in samples.iter().enumerate() {
        deinterleaved[i % 2].push(*sample);
    }
    deinterleaved
}

fn interleave_into(waves: &[Vec<f32>], output: &mut Vec<f32>) {
    if waves.len() < 2 {
        return;
    }
    for i in 0..waves[0].len() {
        output.push(waves[0][i]);
        output.push(waves[1][i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CANONICAL_SAMPLE_RATE;
    use std::path::PathBuf;

    fn write_wav(path: &PathBuf, sample_rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for frame in 0..frames {
            for channel in 0..channels {
                // Distinct ramp per channel so channel mapping is observable.
                let value = ((frame % 100) as i16) * 100 + channel as i16;
                writer.write_sample(value).expect("write sample");
            }
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let result = decode_stem_file(Path::new("/nonexistent/stems/vocals.wav"));
        assert!(matches!(result, Err(DecodeError::FileNotFound { .. })));
    }

    #[test]
    fn test_non_audio_file_is_unsupported_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.wav");
        std::fs::write(&path, b"these are rehearsal notes, not audio").expect("write file");
        let result = decode_stem_file(&path);
        assert!(matches!(result, Err(DecodeError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_canonical_rate_stereo_passes_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("drums.wav");
        write_wav(&path, CANONICAL_SAMPLE_RATE, 2, 4800);

        let decoded = decode_stem_file(&path).expect("decode succeeds");
        assert_eq!(decoded.frames, 4800);
        assert_eq!(decoded.pcm.len(), 4800 * 2);
        assert_eq!(decoded.native_sample_rate, CANONICAL_SAMPLE_RATE);
        assert_eq!(decoded.native_channels, 2);
        assert!(decoded.pcm.iter().all(|sample| sample.abs() <= 1.0));
    }

    #[test]
    fn test_mono_source_is_duplicated_into_both_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("click.wav");
        write_wav(&path, CANONICAL_SAMPLE_RATE, 1, 1000);

        let decoded = decode_stem_file(&path).expect("decode succeeds");
        assert_eq!(decoded.frames, 1000);
        assert_eq!(decoded.native_channels, 1);
        for frame in decoded.pcm.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn test_resampled_source_lands_near_expected_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.wav");
        let source_frames = 44_100;
        write_wav(&path, 44_100, 2, source_frames);

        let decoded = decode_stem_file(&path).expect("decode succeeds");
        let expected =
            source_frames as f64 * CANONICAL_SAMPLE_RATE as f64 / 44_100.0;
        let drift = (decoded.frames as f64 - expected).abs();
        // Sinc flush may add or swallow a handful of frames at the tail.
        assert!(
            drift < 64.0,
            "expected ~{} frames, got {}",
            expected,
            decoded.frames
        );
        assert!(decoded.pcm.iter().all(|sample| sample.is_finite()));
    }

    #[test]
    fn test_repeated_decode_is_bit_identical() {
        // Cache eviction followed by a reload must reproduce the same PCM.
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bass.wav");
        write_wav(&path, 44_100, 2, 22_050);

        let first = decode_stem_file(&path).expect("first decode");
        let second = decode_stem_file(&path).expect("second decode");
        assert_eq!(first.frames, second.frames);
        assert_eq!(first.pcm, second.pcm);
    }

    #[test]
    fn test_to_stereo_averages_wide_layouts() {
        // One 4-channel frame: mean is (0.1 + 0.2 + 0.3 + 0.4) / 4.
        let stereo = to_stereo(&[0.1, 0.2, 0.3, 0.4], 4);
        assert_eq!(stereo.len(), 2);
        assert!((stereo[0] - 0.25).abs() < 1e-6);
        assert_eq!(stereo[0], stereo[1]);
    }
}
