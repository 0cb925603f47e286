//! Output timeline and rodio playback.
//!
//! Segments are placed on a shared timeline at absolute frame positions. A
//! rodio [`Source`] renders the timeline block by block, and the number of
//! frames rendered so far is the output clock the scheduler reads.

use crate::error::{VoiceError, VoiceResult};
use crate::tap::AudioTap;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// Frames rendered per lock of the timeline.
const RENDER_BLOCK: usize = 256;

/// Identifies one scheduled playback on the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where scheduled audio goes. Implemented by the rodio output and by the
/// simulated output used in headless runs.
pub trait AudioOutput {
    /// Output clock in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Begin playing mono `samples` at output time `at` (seconds). Returns the
    /// start actually used, which is later than `at` when the output has
    /// already played past it.
    fn start(&mut self, id: PlaybackId, samples: Arc<[f32]>, at: f64) -> f64;

    /// Cut a playback immediately. Unknown or finished ids are ignored.
    fn stop(&mut self, id: PlaybackId);

    /// Output gain only; scheduling is unaffected.
    fn set_muted(&mut self, muted: bool);
}

struct Voice {
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Timeline shared between the engine thread and the audio callback.
pub struct Timeline {
    sample_rate: u32,
    frames_rendered: AtomicU64,
    voices: Mutex<BTreeMap<PlaybackId, Voice>>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: AtomicU64::new(0),
            voices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    pub fn now(&self) -> f64 {
        self.frames_rendered() as f64 / self.sample_rate as f64
    }

    // A panic inside the audio callback must not wedge the engine.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<PlaybackId, Voice>> {
        self.voices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place a voice and return its start in seconds. A start time already
    /// rendered past begins at the current render position.
    pub fn insert(&self, id: PlaybackId, samples: Arc<[f32]>, at: f64) -> f64 {
        // render() advances the clock under this lock
        let mut voices = self.lock();
        let requested = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(self.frames_rendered());
        voices.insert(id, Voice { start_frame, samples });
        start_frame as f64 / self.sample_rate as f64
    }

    pub fn remove(&self, id: PlaybackId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// Mix the next `out.len()` frames and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut voices = self.lock();
        let base = self.frames_rendered();
        let end = base + out.len() as u64;

        for voice in voices.values() {
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(end);
            if from >= to {
                continue;
            }
            let src = (from - voice.start_frame) as usize;
            let dst = (from - base) as usize;
            let len = (to - from) as usize;
            for (o, s) in out[dst..dst + len].iter_mut().zip(&voice.samples[src..src + len]) {
                *o += *s;
            }
        }
        voices.retain(|_, v| v.end_frame() > end);
        self.frames_rendered.store(end, Ordering::Release);
    }
}

/// Endless mono source that renders a [`Timeline`].
pub struct TimelineSource {
    timeline: Arc<Timeline>,
    block: Vec<f32>,
    pos: usize,
    tap: Option<AudioTap>,
}

impl TimelineSource {
    pub fn new(timeline: Arc<Timeline>, tap: Option<AudioTap>) -> Self {
        Self {
            timeline,
            block: vec![0.0; RENDER_BLOCK],
            pos: RENDER_BLOCK,
            tap,
        }
    }
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.pos >= self.block.len() {
            self.timeline.render(&mut self.block);
            if let Some(ref tap) = self.tap {
                tap.publish(&self.block);
            }
            self.pos = 0;
        }
        let sample = self.block[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.block.len() - self.pos.min(self.block.len()))
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.timeline.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Default output device, fed by a [`TimelineSource`].
pub struct RodioOutput {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Sink,
    timeline: Arc<Timeline>,
}

impl RodioOutput {
    pub fn new(sample_rate: u32, tap: Option<AudioTap>) -> VoiceResult<Self> {
        info!("🔊 Initializing audio output ({}Hz mono)", sample_rate);

        let (stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| VoiceError::Playback(e.to_string()))?;

        let timeline = Arc::new(Timeline::new(sample_rate));
        sink.append(TimelineSource::new(Arc::clone(&timeline), tap));

        info!("✅ Audio output ready");

        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
            sink,
            timeline,
        })
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }
}

impl AudioOutput for RodioOutput {
    fn now(&self) -> f64 {
        self.timeline.now()
    }

    fn start(&mut self, id: PlaybackId, samples: Arc<[f32]>, at: f64) -> f64 {
        self.timeline.insert(id, samples, at)
    }

    fn stop(&mut self, id: PlaybackId) {
        self.timeline.remove(id);
    }

    fn set_muted(&mut self, muted: bool) {
        self.sink.set_volume(if muted { 0.0 } else { 1.0 });
        info!("Output {}", if muted { "muted" } else { "unmuted" });
    }
}
