//! Real-time mixing core.
//!
//! [`MixerCore`] services the output stream's pull callback: it drains a
//! bounded lock-free inbox, advances the transport, sums stems with per-stem
//! effective gains, and publishes position/state/level telemetry through a
//! drop-oldest ring.
//!
//! # Real-time safety
//!
//! `render` never allocates, locks, or touches anything blocking. All state
//! it needs lives in the core itself (owned by the active stream's callback),
//! in atomics on [`MixerShared`], or arrives through the `ArrayQueue` inbox.
//! Transport position, state, master gain, and session live in the shared
//! atomics so a re-created stream (device switch) resumes exactly where the
//! old one stopped. A core whose generation has been retired renders silence
//! and consumes nothing, which lets a new stream take over without the two
//! callbacks racing on the inbox.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::audio::DecodedSong;
use crate::config::{CANONICAL_SAMPLE_RATE, MAX_STEMS};
use crate::protocol::{MixerCommand, MixerTelemetry, TransportState};

/// Slots in the command inbox.
pub const INBOX_CAPACITY: usize = 1024;
/// Slots in the telemetry ring.
pub const TELEMETRY_CAPACITY: usize = 256;
/// Commands applied per callback invocation.
const INBOX_DRAIN_BUDGET: usize = 64;
/// Telemetry cadence: at most one position/levels emission per 50 ms of
/// rendered output.
const EMIT_INTERVAL_FRAMES: u64 = (CANONICAL_SAMPLE_RATE as u64 * 50) / 1000;

const TRANSPORT_STOPPED: u8 = 0;
const TRANSPORT_PLAYING: u8 = 1;
const TRANSPORT_PAUSED: u8 = 2;

/// State shared between the control plane and whichever stream callback is
/// currently active.
pub struct MixerShared {
    pub inbox: ArrayQueue<MixerCommand>,
    pub telemetry: ArrayQueue<MixerTelemetry>,
    position: AtomicU64,
    transport: AtomicU8,
    master_gain_bits: AtomicU32,
    generation: AtomicU64,
    session: AtomicU64,
}

impl MixerShared {
    pub fn new() -> Self {
        Self {
            inbox: ArrayQueue::new(INBOX_CAPACITY),
            telemetry: ArrayQueue::new(TELEMETRY_CAPACITY),
            position: AtomicU64::new(0),
            transport: AtomicU8::new(TRANSPORT_STOPPED),
            master_gain_bits: AtomicU32::new(1.0f32.to_bits()),
            generation: AtomicU64::new(0),
            session: AtomicU64::new(0),
        }
    }

    pub fn position_frames(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn transport(&self) -> TransportState {
        decode_transport(self.transport.load(Ordering::Relaxed))
    }

    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Relaxed)
    }

    /// Generation currently allowed to render.
    pub fn active_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Hands rendering over to `generation`; all older cores go silent.
    pub fn activate_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Control-plane fallback for transport changes when no stream is alive
    /// to drain the inbox (device loss). Never called while a callback runs.
    pub fn force_transport(&self, state: TransportState) {
        self.transport.store(encode_transport(state), Ordering::Relaxed);
    }
}

impl Default for MixerShared {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_transport(value: u8) -> TransportState {
    match value {
        TRANSPORT_PLAYING => TransportState::Playing,
        TRANSPORT_PAUSED => TransportState::Paused,
        _ => TransportState::Stopped,
    }
}

fn encode_transport(state: TransportState) -> u8 {
    match state {
        TransportState::Stopped => TRANSPORT_STOPPED,
        TransportState::Playing => TRANSPORT_PLAYING,
        TransportState::Paused => TRANSPORT_PAUSED,
    }
}

/// Control-plane view of one stem's mix parameters, used to seed a fresh
/// core after a stream re-creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StemMix {
    pub gain: f32,
    pub muted: bool,
    pub solo: bool,
}

/// Snapshot used to build a [`MixerCore`] for a new stream.
#[derive(Clone, Default)]
pub struct MixerSeed {
    pub song: Option<Arc<DecodedSong>>,
    pub stems: Vec<StemMix>,
}

#[derive(Debug, Clone, Copy, Default)]
struct StemState {
    gain: f32,
    muted: bool,
    solo: bool,
    /// Gain actually applied last frame; ramps toward the effective target.
    current_gain: f32,
}

/// Per-stream mixing state. Constructed on a control thread, then owned by
/// the stream callback.
pub struct MixerCore {
    shared: Arc<MixerShared>,
    generation: u64,
    song: Option<Arc<DecodedSong>>,
    stems: [StemState; MAX_STEMS],
    stem_count: usize,
    master_target: f32,
    master_current: f32,
    peaks: [f32; MAX_STEMS],
    master_peak: f32,
    frames_since_emit: u64,
}

impl MixerCore {
    pub fn new(shared: Arc<MixerShared>, generation: u64, seed: MixerSeed) -> Self {
        let mut stems = [StemState::default(); MAX_STEMS];
        // Import and song load both reject songs wider than MAX_STEMS; the
        // min() only bounds indexing into the fixed arrays.
        let stem_count = seed.stems.len().min(MAX_STEMS);
        for (state, mix) in stems.iter_mut().zip(seed.stems.iter()) {
            *state = StemState {
                gain: mix.gain,
                muted: mix.muted,
                solo: mix.solo,
                current_gain: 0.0,
            };
        }
        let master = f32::from_bits(shared.master_gain_bits.load(Ordering::Relaxed));
        let mut core = Self {
            shared,
            generation,
            song: seed.song,
            stems,
            stem_count,
            master_target: master,
            master_current: master,
            peaks: [0.0; MAX_STEMS],
            master_peak: 0.0,
            frames_since_emit: 0,
        };
        // Start ramps settled so a seeded core resumes at exact gains.
        let any_solo = core.any_solo();
        for index in 0..core.stem_count {
            core.stems[index].current_gain = core.effective_gain(index, any_solo);
        }
        core
    }

    /// Fills `output` (interleaved stereo) with the next block of mixed
    /// audio. Hot path; see the module docs for the real-time rules.
    pub fn render(&mut self, output: &mut [f32]) {
        if self.shared.active_generation() != self.generation {
            output.fill(0.0);
            return;
        }

        for _ in 0..INBOX_DRAIN_BUDGET {
            let Some(command) = self.shared.inbox.pop() else {
                break;
            };
            self.apply(command);
        }

        let transport = self.shared.transport();
        let frames = output.len() / 2;
        if transport != TransportState::Playing {
            output.fill(0.0);
            return;
        }
        let Some(song) = self.song.clone() else {
            output.fill(0.0);
            return;
        };

        let position = self.shared.position.load(Ordering::Relaxed);
        let remaining = song.frames.saturating_sub(position) as usize;
        let live_frames = frames.min(remaining);

        let any_solo = self.any_solo();
        let mut steps = [0.0f32; MAX_STEMS];
        let mut targets = [0.0f32; MAX_STEMS];
        for index in 0..self.stem_count {
            targets[index] = self.effective_gain(index, any_solo);
            if live_frames > 0 {
                steps[index] =
                    (targets[index] - self.stems[index].current_gain) / live_frames as f32;
            }
        }
        let master_step = if live_frames > 0 {
            (self.master_target - self.master_current) / live_frames as f32
        } else {
            0.0
        };

        for frame in 0..live_frames {
            let frame_index = position + frame as u64;
            let mut left = 0.0f32;
            let mut right = 0.0f32;
            for index in 0..self.stem_count {
                let state = &mut self.stems[index];
                state.current_gain += steps[index];
                let stem = &song.stems[index];
                if frame_index < stem.frames {
                    let sample_index = (frame_index as usize) * 2;
                    let stem_left = stem.pcm[sample_index] * state.current_gain;
                    let stem_right = stem.pcm[sample_index + 1] * state.current_gain;
                    left += stem_left;
                    right += stem_right;
                    let stem_peak = stem_left.abs().max(stem_right.abs());
                    if stem_peak > self.peaks[index] {
                        self.peaks[index] = stem_peak;
                    }
                }
            }
            self.master_current += master_step;
            let out_left = (left * self.master_current).clamp(-1.0, 1.0);
            let out_right = (right * self.master_current).clamp(-1.0, 1.0);
            output[frame * 2] = out_left;
            output[frame * 2 + 1] = out_right;
            let master_peak = out_left.abs().max(out_right.abs());
            if master_peak > self.master_peak {
                self.master_peak = master_peak;
            }
        }
        output[live_frames * 2..].fill(0.0);

        // Settle ramps exactly on target to stop float drift accumulating.
        for index in 0..self.stem_count {
            self.stems[index].current_gain = targets[index];
        }
        self.master_current = self.master_target;

        let new_position = position + live_frames as u64;
        self.shared.position.store(new_position, Ordering::Relaxed);
        self.frames_since_emit += live_frames as u64;

        if new_position >= song.frames {
            self.emit_position_and_levels(new_position);
            self.set_transport(TransportState::Stopped);
            self.shared.position.store(0, Ordering::Relaxed);
            self.bump_session();
            self.emit_state(TransportState::Stopped);
            return;
        }

        if self.frames_since_emit >= EMIT_INTERVAL_FRAMES {
            self.emit_position_and_levels(new_position);
        }
    }

    fn apply(&mut self, command: MixerCommand) {
        match command {
            MixerCommand::LoadSong(song) => {
                // The control plane refuses to send songs wider than
                // MAX_STEMS (TooManyStems); the min() only bounds indexing
                // into the fixed arrays, since the callback cannot report.
                let stem_count = song.stems.len().min(MAX_STEMS);
                for index in 0..stem_count {
                    let stem = &song.stems[index];
                    let gain = stem.default_gain.clamp(0.0, 1.0);
                    self.stems[index] = StemState {
                        gain,
                        muted: stem.default_muted,
                        solo: false,
                        current_gain: 0.0,
                    };
                }
                self.stem_count = stem_count;
                self.song = Some(song);
                let any_solo = self.any_solo();
                for index in 0..self.stem_count {
                    self.stems[index].current_gain = self.effective_gain(index, any_solo);
                }
                self.shared.position.store(0, Ordering::Relaxed);
                self.set_transport(TransportState::Stopped);
                self.bump_session();
                self.emit_state(TransportState::Stopped);
            }
            MixerCommand::Unload => {
                self.song = None;
                self.stem_count = 0;
                self.shared.position.store(0, Ordering::Relaxed);
                self.set_transport(TransportState::Stopped);
                self.bump_session();
                self.emit_state(TransportState::Stopped);
            }
            MixerCommand::Play => {
                if self.song.is_none() {
                    return;
                }
                if self.shared.transport() == TransportState::Stopped {
                    self.shared.position.store(0, Ordering::Relaxed);
                }
                self.set_transport(TransportState::Playing);
                self.emit_state(TransportState::Playing);
            }
            MixerCommand::Pause => {
                if self.shared.transport() == TransportState::Playing {
                    self.set_transport(TransportState::Paused);
                    self.emit_state(TransportState::Paused);
                }
            }
            MixerCommand::Stop => {
                self.shared.position.store(0, Ordering::Relaxed);
                if self.shared.transport() != TransportState::Stopped {
                    self.set_transport(TransportState::Stopped);
                    self.bump_session();
                    self.emit_state(TransportState::Stopped);
                }
            }
            MixerCommand::Seek { frame } => {
                let clamped = match self.song.as_ref() {
                    Some(song) => frame.min(song.frames),
                    None => 0,
                };
                self.shared.position.store(clamped, Ordering::Relaxed);
            }
            MixerCommand::SetStemGain { stem, gain } => {
                if stem < self.stem_count {
                    self.stems[stem].gain = gain.clamp(0.0, 1.0);
                }
            }
            MixerCommand::SetStemMute { stem, muted } => {
                if stem < self.stem_count {
                    self.stems[stem].muted = muted;
                }
            }
            MixerCommand::SetStemSolo { stem, solo } => {
                if stem < self.stem_count {
                    self.stems[stem].solo = solo;
                }
            }
            MixerCommand::SetMasterGain { gain } => {
                let clamped = gain.clamp(0.0, 1.0);
                self.master_target = clamped;
                self.shared
                    .master_gain_bits
                    .store(clamped.to_bits(), Ordering::Relaxed);
            }
        }
    }

    fn any_solo(&self) -> bool {
        self.stems[..self.stem_count].iter().any(|stem| stem.solo)
    }

    /// Effective audibility: muted wins, then solo arithmetic, then gain.
    fn effective_gain(&self, index: usize, any_solo: bool) -> f32 {
        let stem = &self.stems[index];
        if stem.muted || (any_solo && !stem.solo) {
            0.0
        } else {
            stem.gain
        }
    }

    fn set_transport(&self, state: TransportState) {
        self.shared
            .transport
            .store(encode_transport(state), Ordering::Relaxed);
    }

    fn bump_session(&self) {
        self.shared.session.fetch_add(1, Ordering::Relaxed);
    }

    fn emit_state(&self, state: TransportState) {
        let _ = self.shared.telemetry.force_push(MixerTelemetry::State {
            state,
            session: self.shared.session(),
        });
    }

    fn emit_position_and_levels(&mut self, frame: u64) {
        let session = self.shared.session();
        let _ = self
            .shared
            .telemetry
            .force_push(MixerTelemetry::Position { frame, session });
        let _ = self.shared.telemetry.force_push(MixerTelemetry::Levels {
            stem_peaks: self.peaks,
            stem_count: self.stem_count,
            master_peak: self.master_peak,
            session,
        });
        self.peaks = [0.0; MAX_STEMS];
        self.master_peak = 0.0;
        self.frames_since_emit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::{constant_stem, song_of};

    fn core_with_song(song: crate::audio::DecodedSong) -> (Arc<MixerShared>, MixerCore) {
        let shared = Arc::new(MixerShared::new());
        let mut core = MixerCore::new(shared.clone(), 0, MixerSeed::default());
        shared
            .inbox
            .push(MixerCommand::LoadSong(Arc::new(song)))
            .ok()
            .expect("inbox push");
        let mut scratch = [0.0f32; 16];
        core.render(&mut scratch);
        (shared, core)
    }

    fn drain_telemetry(shared: &MixerShared) -> Vec<MixerTelemetry> {
        let mut drained = Vec::new();
        while let Some(event) = shared.telemetry.pop() {
            drained.push(event);
        }
        drained
    }

    fn render_frames(core: &mut MixerCore, frames: usize) -> Vec<f32> {
        let mut output = vec![0.0f32; frames * 2];
        core.render(&mut output);
        output
    }

    fn push(shared: &MixerShared, command: MixerCommand) {
        shared.inbox.push(command).ok().expect("inbox push");
    }

    #[test]
    fn test_stopped_transport_renders_silence() {
        let song = song_of("s", vec![constant_stem("a", 0.5, 1000)]);
        let (_shared, mut core) = core_with_song(song);
        let output = render_frames(&mut core, 64);
        assert!(output.iter().all(|sample| *sample == 0.0));
    }

    #[test]
    fn test_play_mixes_stems_and_clamps() {
        let song = song_of(
            "s",
            vec![constant_stem("a", 0.8, 1000), constant_stem("b", 0.8, 1000)],
        );
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        // First buffer completes any ramp; the second is steady state.
        render_frames(&mut core, 64);
        let output = render_frames(&mut core, 64);
        // 0.8 + 0.8 = 1.6, clamped to 1.0.
        assert!(output.iter().all(|sample| (*sample - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_solo_silences_non_soloed_stems() {
        let song = song_of(
            "s",
            vec![
                constant_stem("a", 0.3, 48_000),
                constant_stem("b", 0.4, 48_000),
                constant_stem("c", 0.2, 48_000),
            ],
        );
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        push(&shared, MixerCommand::SetStemSolo { stem: 1, solo: true });
        render_frames(&mut core, 128);
        let output = render_frames(&mut core, 128);
        // Only stem b remains: every sample is its constant value.
        assert!(output.iter().all(|sample| (*sample - 0.4).abs() < 1e-5));
    }

    #[test]
    fn test_muted_stem_contributes_nothing_even_when_soloed() {
        let song = song_of(
            "s",
            vec![constant_stem("a", 0.3, 48_000), constant_stem("b", 0.4, 48_000)],
        );
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        push(&shared, MixerCommand::SetStemMute { stem: 1, muted: true });
        push(&shared, MixerCommand::SetStemSolo { stem: 1, solo: true });
        render_frames(&mut core, 128);
        let output = render_frames(&mut core, 128);
        assert!(output.iter().all(|sample| sample.abs() < 1e-5));
    }

    #[test]
    fn test_gain_change_ramps_within_one_buffer() {
        let song = song_of("s", vec![constant_stem("a", 0.5, 48_000)]);
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 64);

        push(&shared, MixerCommand::SetStemGain { stem: 0, gain: 0.0 });
        let ramp_buffer = render_frames(&mut core, 64);
        // Mid-buffer samples sit strictly between the old and new level.
        assert!(ramp_buffer[2].abs() > 0.0);
        assert!(ramp_buffer[2].abs() < 0.5);
        // Ramp has settled by the following buffer.
        let settled = render_frames(&mut core, 64);
        assert!(settled.iter().all(|sample| *sample == 0.0));
    }

    #[test]
    fn test_transport_semantics() {
        let song = song_of("s", vec![constant_stem("a", 0.1, 48_000)]);
        let (shared, mut core) = core_with_song(song);

        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 480);
        assert_eq!(shared.transport(), TransportState::Playing);
        assert_eq!(shared.position_frames(), 480);

        push(&shared, MixerCommand::Pause);
        render_frames(&mut core, 480);
        assert_eq!(shared.transport(), TransportState::Paused);
        assert_eq!(shared.position_frames(), 480);

        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 480);
        assert_eq!(shared.position_frames(), 960);

        push(&shared, MixerCommand::Stop);
        render_frames(&mut core, 16);
        assert_eq!(shared.transport(), TransportState::Stopped);
        assert_eq!(shared.position_frames(), 0);

        // Play from Stopped restarts at frame zero.
        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 480);
        assert_eq!(shared.position_frames(), 480);
    }

    #[test]
    fn test_seek_clamps_to_song_length() {
        let song = song_of("s", vec![constant_stem("a", 0.1, 1000)]);
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Seek { frame: 5_000 });
        render_frames(&mut core, 16);
        assert_eq!(shared.position_frames(), 1000);

        push(&shared, MixerCommand::Seek { frame: 250 });
        render_frames(&mut core, 16);
        assert_eq!(shared.position_frames(), 250);
    }

    #[test]
    fn test_playback_past_end_stops_and_zero_fills() {
        let song = song_of("s", vec![constant_stem("a", 0.5, 100)]);
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        drain_telemetry(&shared);

        let output = render_frames(&mut core, 256);
        assert_eq!(shared.transport(), TransportState::Stopped);
        assert_eq!(shared.position_frames(), 0);
        // Frames beyond the song end are silent.
        assert!(output[200..].iter().all(|sample| *sample == 0.0));

        let events = drain_telemetry(&shared);
        assert!(events.iter().any(|event| matches!(
            event,
            MixerTelemetry::State {
                state: TransportState::Stopped,
                ..
            }
        )));
    }

    #[test]
    fn test_seek_past_end_while_playing_stops_on_next_buffer() {
        let song = song_of("s", vec![constant_stem("a", 0.5, 1000)]);
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 64);

        push(&shared, MixerCommand::Seek { frame: 10_000 });
        let output = render_frames(&mut core, 64);
        assert!(output.iter().all(|sample| *sample == 0.0));
        assert_eq!(shared.transport(), TransportState::Stopped);
    }

    #[test]
    fn test_shorter_stem_goes_silent_while_longer_plays_on() {
        let song = song_of(
            "s",
            vec![constant_stem("long", 0.25, 200), constant_stem("short", 0.25, 50)],
        );
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        let output = render_frames(&mut core, 200);
        // Both stems audible up front, only the long one near the end.
        assert!((output[0] - 0.5).abs() < 0.5); // ramp-up start
        assert!((output[2 * 80] - 0.25).abs() < 1e-5);
        assert!((output[2 * 199] - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_retired_generation_renders_silence_and_keeps_inbox() {
        let song = song_of("s", vec![constant_stem("a", 0.5, 1000)]);
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 64);

        shared.activate_generation(1);
        push(&shared, MixerCommand::Pause);
        let output = render_frames(&mut core, 64);
        assert!(output.iter().all(|sample| *sample == 0.0));
        // The retired core must not have consumed the command.
        assert_eq!(shared.inbox.len(), 1);
    }

    #[test]
    fn test_inbox_drain_is_bounded_per_callback() {
        let song = song_of("s", vec![constant_stem("a", 0.5, 1000)]);
        let (shared, mut core) = core_with_song(song);
        for _ in 0..100 {
            push(&shared, MixerCommand::SetMasterGain { gain: 0.5 });
        }
        render_frames(&mut core, 16);
        assert_eq!(shared.inbox.len(), 100 - INBOX_DRAIN_BUDGET);
    }

    #[test]
    fn test_position_telemetry_cadence() {
        let song = song_of("s", vec![constant_stem("a", 0.1, 96_000)]);
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        drain_telemetry(&shared);

        // One second of output in 480-frame buffers.
        for _ in 0..100 {
            render_frames(&mut core, 480);
        }
        let positions = drain_telemetry(&shared)
            .into_iter()
            .filter(|event| matches!(event, MixerTelemetry::Position { .. }))
            .count();
        // 50 ms cadence over one second.
        assert!((15..=25).contains(&positions), "got {positions}");
    }

    #[test]
    fn test_load_song_resets_transport_and_session() {
        let first = song_of("first", vec![constant_stem("a", 0.1, 48_000)]);
        let (shared, mut core) = core_with_song(first);
        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 480);
        let session_before = shared.session();

        let second = song_of("second", vec![constant_stem("b", 0.1, 48_000)]);
        push(&shared, MixerCommand::LoadSong(Arc::new(second)));
        render_frames(&mut core, 16);
        assert_eq!(shared.transport(), TransportState::Stopped);
        assert_eq!(shared.position_frames(), 0);
        assert!(shared.session() > session_before);
    }

    #[test]
    fn test_seeded_core_resumes_at_shared_position() {
        let song = Arc::new(song_of("s", vec![constant_stem("a", 0.25, 48_000)]));
        let shared = Arc::new(MixerShared::new());
        let mut core = MixerCore::new(shared.clone(), 0, MixerSeed::default());
        push(&shared, MixerCommand::LoadSong(song.clone()));
        push(&shared, MixerCommand::Play);
        render_frames(&mut core, 480);
        let position_before = shared.position_frames();

        // Device switch: a new core seeded from the control-plane mirror.
        let seed = MixerSeed {
            song: Some(song),
            stems: vec![StemMix {
                gain: 1.0,
                muted: false,
                solo: false,
            }],
        };
        let mut replacement = MixerCore::new(shared.clone(), 1, seed);
        shared.activate_generation(1);
        let output = render_frames(&mut replacement, 480);
        assert_eq!(shared.position_frames(), position_before + 480);
        assert!(output.iter().all(|sample| (*sample - 0.25).abs() < 1e-5));
    }

    #[test]
    fn test_levels_track_stem_and_master_peaks() {
        let song = song_of(
            "s",
            vec![constant_stem("a", 0.5, 48_000), constant_stem("b", 0.25, 48_000)],
        );
        let (shared, mut core) = core_with_song(song);
        push(&shared, MixerCommand::Play);
        drain_telemetry(&shared);

        // Render beyond one emission interval.
        for _ in 0..6 {
            render_frames(&mut core, 480);
        }
        let levels = drain_telemetry(&shared).into_iter().find_map(|event| match event {
            MixerTelemetry::Levels {
                stem_peaks,
                stem_count,
                master_peak,
                ..
            } => Some((stem_peaks, stem_count, master_peak)),
            _ => None,
        });
        let (stem_peaks, stem_count, master_peak) = levels.expect("levels emitted");
        assert_eq!(stem_count, 2);
        assert!((stem_peaks[0] - 0.5).abs() < 1e-3);
        assert!((stem_peaks[1] - 0.25).abs() < 1e-3);
        assert!((master_peak - 0.75).abs() < 1e-3);
    }
}
