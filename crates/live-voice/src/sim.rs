//! In-memory devices and channel for headless runs and tests.
//!
//! Every type here is a cheap handle over shared state, so a clone kept by the
//! caller can drive and observe the instance owned by the engine.

use crate::capture::{CaptureStream, FrameSink, Microphone};
use crate::channel::{
    ChannelConnector, ChannelEvents, ChannelHandle, InboundAudio, OutboundChunk, ServerMessage,
};
use crate::codec;
use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::output::{AudioOutput, PlaybackId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Output clock advanced by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Move the clock to `t`. Going backwards is ignored.
    pub fn set(&self, t: f64) {
        if t > self.now() {
            self.bits.store(t.to_bits(), Ordering::Release);
        }
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.now() + dt.max(0.0));
    }
}

/// A playback started on the simulated output.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedPlayback {
    pub id: PlaybackId,
    pub at: f64,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct OutputLog {
    started: Vec<StartedPlayback>,
    stopped: Vec<PlaybackId>,
    muted: bool,
}

/// Output that records what it was asked to play against a [`ManualClock`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedOutput {
    clock: ManualClock,
    log: Arc<Mutex<OutputLog>>,
}

impl SimulatedOutput {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            log: Arc::default(),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn started(&self) -> Vec<StartedPlayback> {
        lock(&self.log).started.clone()
    }

    pub fn was_stopped(&self, id: PlaybackId) -> bool {
        lock(&self.log).stopped.contains(&id)
    }

    pub fn stopped(&self) -> usize {
        lock(&self.log).stopped.len()
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.log).muted
    }
}

impl AudioOutput for SimulatedOutput {
    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn start(&mut self, id: PlaybackId, samples: Arc<[f32]>, at: f64) -> f64 {
        let at = at.max(self.clock.now());
        lock(&self.log).started.push(StartedPlayback {
            id,
            at,
            samples: samples.len(),
        });
        at
    }

    fn stop(&mut self, id: PlaybackId) {
        lock(&self.log).stopped.push(id);
    }

    fn set_muted(&mut self, muted: bool) {
        lock(&self.log).muted = muted;
    }
}

#[derive(Debug, Default)]
struct MicState {
    sink: Option<FrameSink>,
    unavailable: bool,
    opens: usize,
    closes: usize,
}

/// Microphone whose frames are pushed by the caller.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl SimulatedMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent opens fail as if access were denied.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Deliver one frame as the device callback would. Returns false when closed.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => sink.push(samples),
            None => false,
        }
    }

    /// Report a device failure on the open stream.
    pub fn fail(&self, message: &str) -> bool {
        let sink = lock(&self.state).sink.clone();
        sink.map(|s| s.fail(message)).unwrap_or(false)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).sink.is_some()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }
}

impl Microphone for SimulatedMicrophone {
    fn open(
        &mut self,
        _sample_rate: u32,
        _frame_size: usize,
        sink: FrameSink,
    ) -> VoiceResult<Box<dyn CaptureStream>> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(VoiceError::Device("Permission denied".to_string()));
        }
        state.sink = Some(sink);
        state.opens += 1;
        Ok(Box::new(SimulatedCaptureStream {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct SimulatedCaptureStream {
    state: Arc<Mutex<MicState>>,
    open: bool,
}

impl CaptureStream for SimulatedCaptureStream {
    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = lock(&self.state);
        state.sink = None;
        state.closes += 1;
    }
}

#[derive(Debug, Default)]
struct ChannelLog {
    attempts: Vec<(SessionConfig, ChannelEvents)>,
    sent: Vec<OutboundChunk>,
    closes: usize,
    refuse: Option<String>,
}

/// Channel whose server side is scripted by the caller.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    log: Arc<Mutex<ChannelLog>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent opens fail synchronously with `reason`.
    pub fn refuse(&self, reason: Option<&str>) {
        lock(&self.log).refuse = reason.map(str::to_string);
    }

    pub fn attempts(&self) -> usize {
        lock(&self.log).attempts.len()
    }

    /// Event sender of open attempt `index`, to play the server's part.
    pub fn attempt(&self, index: usize) -> Option<ChannelEvents> {
        lock(&self.log).attempts.get(index).map(|(_, e)| e.clone())
    }

    pub fn latest(&self) -> Option<ChannelEvents> {
        lock(&self.log).attempts.last().map(|(_, e)| e.clone())
    }

    pub fn config_of(&self, index: usize) -> Option<SessionConfig> {
        lock(&self.log).attempts.get(index).map(|(c, _)| c.clone())
    }

    pub fn sent(&self) -> Vec<OutboundChunk> {
        lock(&self.log).sent.clone()
    }

    pub fn closes(&self) -> usize {
        lock(&self.log).closes
    }
}

impl ChannelConnector for ScriptedConnector {
    fn open(
        &mut self,
        session: &SessionConfig,
        events: ChannelEvents,
    ) -> VoiceResult<Box<dyn ChannelHandle>> {
        let mut log = lock(&self.log);
        if let Some(ref reason) = log.refuse {
            return Err(VoiceError::Connection(reason.clone()));
        }
        log.attempts.push((session.clone(), events));
        Ok(Box::new(ScriptedChannel {
            log: Arc::clone(&self.log),
            closed: false,
        }))
    }
}

struct ScriptedChannel {
    log: Arc<Mutex<ChannelLog>>,
    closed: bool,
}

impl ChannelHandle for ScriptedChannel {
    fn send(&mut self, chunk: OutboundChunk) {
        if !self.closed {
            lock(&self.log).sent.push(chunk);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.log).closes += 1;
        }
    }
}

/// Build an audio message carrying `samples` as base64 PCM.
pub fn audio_message(samples: &[f32], sample_rate: u32) -> ServerMessage {
    ServerMessage::Audio(InboundAudio {
        data: codec::encode_base64(&codec::encode(samples)),
        sample_rate,
        channels: 1,
    })
}

/// Audio message of silence lasting `seconds`.
pub fn silence_message(seconds: f64, sample_rate: u32) -> ServerMessage {
    let n = (seconds * sample_rate as f64).round() as usize;
    audio_message(&vec![0.0; n], sample_rate)
}
