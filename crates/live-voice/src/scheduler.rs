//! Gapless playback scheduling of inbound segments.
//!
//! Each segment starts at `max(next_playback_time, now)` and pushes
//! `next_playback_time` to its end, so segments arriving faster than real time
//! queue back to back and segments arriving late start immediately. Finished
//! playbacks are removed by a clock-driven [`PlaybackScheduler::sweep`] rather
//! than by per-buffer callbacks.

use crate::output::{AudioOutput, PlaybackId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A decoded segment ready for scheduling.
#[derive(Debug, Clone)]
pub struct InboundSegment {
    /// Mono samples at the output rate.
    pub samples: Arc<[f32]>,
    /// Seconds.
    pub duration: f64,
}

impl InboundSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration = samples.len() as f64 / sample_rate as f64;
        Self {
            samples: Arc::from(samples),
            duration,
        }
    }
}

/// A segment bound to a range on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start: f64,
    pub end: f64,
}

pub struct PlaybackScheduler<O> {
    output: O,
    active: BTreeMap<PlaybackId, ScheduledPlayback>,
    next_playback_time: f64,
    next_id: u64,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            active: BTreeMap::new(),
            next_playback_time: 0.0,
            next_id: 0,
        }
    }

    /// Schedule a segment after everything already queued.
    ///
    /// The output may move the start later if it plays past the requested
    /// time before the segment lands; the queue continues from where the
    /// segment really ends.
    pub fn schedule(&mut self, segment: InboundSegment) -> ScheduledPlayback {
        let now = self.output.now();
        let requested = self.next_playback_time.max(now);
        let id = PlaybackId(self.next_id);
        self.next_id += 1;

        let start = self.output.start(id, segment.samples, requested);
        let end = start + segment.duration;
        self.next_playback_time = end;

        let playback = ScheduledPlayback { id, start, end };
        self.active.insert(id, playback);
        debug!(
            "Scheduled {} at [{:.3}, {:.3}) (clock {:.3}, {} active)",
            id,
            start,
            end,
            now,
            self.active.len()
        );
        playback
    }

    /// Drop every playback whose end the output clock has passed.
    pub fn sweep(&mut self) -> usize {
        let now = self.output.now();
        let before = self.active.len();
        self.active.retain(|_, p| p.end > now);
        before - self.active.len()
    }

    /// Remove one playback. Removing an already removed entry is a no-op.
    pub fn complete(&mut self, id: PlaybackId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Hard-cut everything in flight and forget the queue position, so the next
    /// segment starts from the current clock.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.output.stop(*id);
        }
        self.active.clear();
        self.next_playback_time = 0.0;
        if stopped > 0 {
            info!("⏹️ Playback interrupted ({} segment(s) cut)", stopped);
        }
        stopped
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.output.set_muted(muted);
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> impl Iterator<Item = &ScheduledPlayback> {
        self.active.values()
    }

    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn now(&self) -> f64 {
        self.output.now()
    }

    pub fn output(&self) -> &O {
        &self.output
    }

}
