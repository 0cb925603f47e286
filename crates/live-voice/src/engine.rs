//! Session lifecycle manager.
//!
//! Every input to the engine (user commands, channel callbacks, captured
//! frames, sweep ticks) arrives as an [`EngineEvent`] on one queue and is
//! handled to completion before the next, so session state has a single
//! writer. Nothing in a handler blocks: channel sends are fire-and-forget and
//! waiting for the channel to open is just another event.
//!
//! Callbacks from a superseded open attempt are recognised by their
//! [`Generation`] and dropped; frames from a closed microphone stream are
//! recognised by their capture epoch.

use crate::capture::{CapturePipeline, Microphone};
use crate::channel::{
    ChannelConnector, ChannelEvent, ChannelEvents, ChannelHandle, InboundAudio, ServerMessage,
};
use crate::codec;
use crate::config::{AudioSettings, LiveConfig, SessionConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::output::AudioOutput;
use crate::scheduler::{InboundSegment, PlaybackScheduler};
use crate::session::{Generation, Session, SessionState};
use crate::tap::AudioTap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Requests from the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Connect,
    StartRecording,
    StopRecording,
    ToggleRecording,
    /// Tear down and reconnect, optionally with a new configuration.
    ResetSession(Option<SessionConfig>),
    SetMuted(bool),
    ToggleMute,
    Shutdown,
}

#[derive(Debug)]
pub enum EngineEvent {
    Command(EngineCommand),
    Channel {
        generation: Generation,
        event: ChannelEvent,
    },
    CaptureFrame {
        epoch: Generation,
        samples: Vec<f32>,
    },
    CaptureFailed {
        epoch: Generation,
        message: String,
    },
    /// Sweep finished playbacks.
    Tick,
}

/// Updates for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    Status(String),
    Error(String),
    /// Non-fatal problem, e.g. a dropped inbound payload.
    Warning(String),
    SessionReady(bool),
    StateChanged(SessionState),
    TurnComplete,
}

/// Clonable handle that posts commands into the engine queue.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) -> VoiceResult<()> {
        self.tx
            .send(EngineEvent::Command(command))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub fn start_recording(&self) -> VoiceResult<()> {
        self.send(EngineCommand::StartRecording)
    }

    pub fn stop_recording(&self) -> VoiceResult<()> {
        self.send(EngineCommand::StopRecording)
    }

    pub fn toggle_recording(&self) -> VoiceResult<()> {
        self.send(EngineCommand::ToggleRecording)
    }

    pub fn reset_session(&self, config: Option<SessionConfig>) -> VoiceResult<()> {
        self.send(EngineCommand::ResetSession(config))
    }

    pub fn set_muted(&self, muted: bool) -> VoiceResult<()> {
        self.send(EngineCommand::SetMuted(muted))
    }

    pub fn toggle_mute(&self) -> VoiceResult<()> {
        self.send(EngineCommand::ToggleMute)
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(EngineCommand::Shutdown)
    }
}

pub struct VoiceEngine<C, M, O> {
    settings: AudioSettings,
    session: Session,
    connector: C,
    channel: Option<Box<dyn ChannelHandle>>,
    capture: CapturePipeline<M>,
    scheduler: PlaybackScheduler<O>,
    muted: bool,
    running: bool,
    input_tap: AudioTap,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    notices: mpsc::UnboundedSender<EngineNotice>,
}

impl<C, M, O> VoiceEngine<C, M, O>
where
    C: ChannelConnector,
    M: Microphone,
    O: AudioOutput,
{
    /// Build an engine in `Disconnected`. Returns the notice stream for the UI.
    pub fn new(
        config: &LiveConfig,
        connector: C,
        microphone: M,
        output: O,
    ) -> (Self, mpsc::UnboundedReceiver<EngineNotice>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let engine = Self {
            settings: config.audio.clone(),
            session: Session::new(config.session.clone(), Generation::default()),
            connector,
            channel: None,
            capture: CapturePipeline::new(
                microphone,
                config.audio.input_sample_rate,
                config.audio.frame_size,
            ),
            scheduler: PlaybackScheduler::new(output),
            muted: false,
            running: false,
            input_tap: AudioTap::new(),
            events_tx,
            events_rx: Some(events_rx),
            notices,
        };
        (engine, notices_rx)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.events_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_ready(&self) -> bool {
        self.session.state().is_open()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<O> {
        &self.scheduler
    }

    pub fn capture(&self) -> &CapturePipeline<M> {
        &self.capture
    }

    /// Captured microphone frames, for level display.
    pub fn input_tap(&self) -> &AudioTap {
        &self.input_tap
    }

    fn notify(&self, notice: EngineNotice) {
        let _ = self.notices.send(notice);
    }

    fn status(&self, text: impl Into<String>) {
        let text = text.into();
        debug!("Status: {}", text);
        self.notify(EngineNotice::Status(text));
    }

    fn set_state(&mut self, next: SessionState) {
        let prev = self.session.state();
        if prev == next {
            return;
        }
        if self.session.transition(next) {
            self.announce_transition(prev, next);
        } else {
            warn!("Refusing transition {} → {}", prev, next);
        }
    }

    fn force_state(&mut self, next: SessionState) {
        let prev = self.session.state();
        self.session.force(next);
        if prev != next {
            self.announce_transition(prev, next);
        }
    }

    fn announce_transition(&self, prev: SessionState, next: SessionState) {
        info!(
            session = %self.session.id,
            generation = %self.session.generation,
            "{} → {}",
            prev,
            next
        );
        self.notify(EngineNotice::StateChanged(next));
    }

    /// Open the first channel. Only valid from `Disconnected`.
    pub fn connect(&mut self) -> VoiceResult<()> {
        if self.state() != SessionState::Disconnected {
            return Err(VoiceError::Precondition(format!(
                "Cannot connect while {}",
                self.state()
            )));
        }
        self.open_channel()
    }

    fn open_channel(&mut self) -> VoiceResult<()> {
        self.force_state(SessionState::Connecting);
        info!(
            session = %self.session.id,
            generation = %self.session.generation,
            "🔌 Opening channel (model {}, voice {})",
            self.session.config.model,
            self.session.config.voice
        );

        let opened = self.session.config.validate().and_then(|_| {
            let events = ChannelEvents::new(self.session.generation, self.events_tx.clone());
            self.connector.open(&self.session.config, events)
        });

        match opened {
            Ok(handle) => {
                self.channel = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    VoiceError::Connection(_) => e,
                    other => VoiceError::Connection(other.to_string()),
                };
                self.enter_error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Begin streaming the microphone. Only valid in `Ready`.
    pub fn start_recording(&mut self) -> VoiceResult<()> {
        if self.state() != SessionState::Ready {
            let err = VoiceError::Precondition(format!(
                "Cannot start recording while {}",
                self.state()
            ));
            debug!("{}", err);
            return Err(err);
        }

        self.status("Requesting microphone...");
        match self
            .capture
            .start(self.events_tx.clone(), Some(self.input_tap.clone()))
        {
            Ok(()) => {
                self.set_state(SessionState::Recording);
                self.status("Listening...");
                Ok(())
            }
            Err(e) => {
                warn!("Microphone unavailable: {}", e);
                self.status(format!("Mic Error: {}", e));
                Err(match e {
                    VoiceError::Device(_) => e,
                    other => VoiceError::Device(other.to_string()),
                })
            }
        }
    }

    /// Stop streaming the microphone, keeping the channel open.
    pub fn stop_recording(&mut self) -> VoiceResult<()> {
        if self.state() != SessionState::Recording {
            return Ok(());
        }
        self.capture.stop();
        self.set_state(SessionState::Ready);
        self.status("Not listening");
        Ok(())
    }

    pub fn toggle_recording(&mut self) -> VoiceResult<()> {
        if self.state() == SessionState::Recording {
            self.stop_recording()
        } else {
            self.start_recording()
        }
    }

    /// Drop everything and reconnect. Valid from any state; an in-flight open
    /// attempt is cancelled and its late callbacks are ignored.
    pub fn reset_session(&mut self, config: Option<SessionConfig>) -> VoiceResult<()> {
        info!(session = %self.session.id, "🔄 Resetting session");
        self.release_resources();

        let config = config.unwrap_or_else(|| self.session.config.clone());
        self.session = self.session.successor(config);
        self.notify(EngineNotice::SessionReady(false));

        let opened = self.open_channel();
        if opened.is_ok() {
            self.status("Session restarted");
        }
        opened
    }

    /// Output gain only. Session state is untouched.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.scheduler.set_muted(muted);
    }

    /// Release everything and end the event loop.
    pub fn shutdown(&mut self) {
        if self.state() != SessionState::Disconnected {
            self.force_state(SessionState::Closing);
            self.release_resources();
            // stale callbacks from the channel just closed must not revive the session
            let config = self.session.config.clone();
            self.session = self.session.successor(config);
            self.announce_transition(SessionState::Closing, SessionState::Disconnected);
            self.notify(EngineNotice::SessionReady(false));
            self.status("Session closed: local shutdown");
        }
        self.running = false;
    }

    /// Stop capture, close the channel, and cut all playback.
    fn release_resources(&mut self) {
        self.capture.stop();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.scheduler.interrupt();
    }

    fn enter_error(&mut self, message: &str) {
        error!(
            session = %self.session.id,
            generation = %self.session.generation,
            "Session error: {}",
            message
        );
        self.release_resources();
        self.force_state(SessionState::Error);
        self.notify(EngineNotice::SessionReady(false));
        self.notify(EngineNotice::Error(message.to_string()));
    }

    /// Handle one event to completion.
    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Command(command) => self.handle_command(command),
            EngineEvent::Channel { generation, event } => {
                if !self.session.is_current(generation) {
                    warn!(
                        "Ignoring {:?} from stale channel {} (current {})",
                        event_name(&event),
                        generation,
                        self.session.generation
                    );
                    return;
                }
                self.handle_channel_event(event);
            }
            EngineEvent::CaptureFrame { epoch, samples } => self.handle_frame(epoch, samples),
            EngineEvent::CaptureFailed { epoch, message } => {
                if !self.capture.accepts(epoch) {
                    return;
                }
                warn!("Microphone failed: {}", message);
                self.capture.stop();
                self.set_state(SessionState::Ready);
                self.status(format!("Mic Error: {}", message));
            }
            EngineEvent::Tick => {
                let finished = self.scheduler.sweep();
                if finished > 0 {
                    trace!("Swept {} finished playback(s)", finished);
                }
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        let result = match command {
            EngineCommand::Connect => self.connect(),
            EngineCommand::StartRecording => self.start_recording(),
            EngineCommand::StopRecording => self.stop_recording(),
            EngineCommand::ToggleRecording => self.toggle_recording(),
            EngineCommand::ResetSession(config) => self.reset_session(config),
            EngineCommand::SetMuted(muted) => {
                self.set_muted(muted);
                Ok(())
            }
            EngineCommand::ToggleMute => {
                self.set_muted(!self.muted);
                Ok(())
            }
            EngineCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };
        // connection and device failures were already surfaced as status text
        if let Err(VoiceError::Precondition(msg)) = result {
            self.notify(EngineNotice::Error(msg));
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        let state = self.state();
        match event {
            ChannelEvent::Opened => {
                if state == SessionState::Connecting {
                    self.set_state(SessionState::Ready);
                    self.status("Session started");
                    self.notify(EngineNotice::SessionReady(true));
                } else {
                    debug!("Ignoring open while {}", state);
                }
            }
            ChannelEvent::Message(message) => {
                if state.is_open() {
                    self.handle_server_message(message);
                } else {
                    debug!("Ignoring message while {}", state);
                }
            }
            ChannelEvent::Error(message) => {
                if matches!(
                    state,
                    SessionState::Connecting | SessionState::Ready | SessionState::Recording
                ) {
                    self.enter_error(&message);
                }
            }
            ChannelEvent::Closed(reason) => {
                if matches!(
                    state,
                    SessionState::Connecting | SessionState::Ready | SessionState::Recording
                ) {
                    let lifetime = chrono::Utc::now() - self.session.created_at;
                    info!(
                        session = %self.session.id,
                        "Channel closed after {}s: {}",
                        lifetime.num_seconds(),
                        reason
                    );
                    self.release_resources();
                    self.force_state(SessionState::Disconnected);
                    self.notify(EngineNotice::SessionReady(false));
                    self.status(format!("Session closed: {}", reason));
                }
            }
        }
    }

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Audio(audio) => self.play(audio),
            ServerMessage::Interrupted => {
                info!("⚡ Interrupted by user speech");
                self.scheduler.interrupt();
            }
            ServerMessage::TurnComplete => self.notify(EngineNotice::TurnComplete),
            ServerMessage::Other => {}
        }
    }

    /// Decode and schedule one inbound payload. A malformed payload is dropped
    /// on its own; the session carries on.
    fn play(&mut self, audio: InboundAudio) {
        let decoded = match codec::decode_base64(&audio.data, audio.sample_rate, audio.channels) {
            Ok(d) => d,
            Err(e) => {
                warn!("Dropping inbound audio: {}", e);
                self.notify(EngineNotice::Warning(format!("Dropped audio segment: {}", e)));
                return;
            }
        };
        if decoded.samples.is_empty() {
            return;
        }

        let rate = decoded.sample_rate;
        let mono = decoded.into_mono();
        let samples = codec::resample_linear(&mono, rate, self.settings.output_sample_rate);
        self.scheduler
            .schedule(InboundSegment::new(samples, self.settings.output_sample_rate));
    }

    fn handle_frame(&mut self, epoch: Generation, samples: Vec<f32>) {
        if self.state() != SessionState::Recording || !self.capture.accepts(epoch) {
            trace!("Dropping capture frame while {}", self.state());
            return;
        }
        let chunk = self.capture.encode(&samples);
        if let Some(channel) = self.channel.as_mut() {
            channel.send(chunk);
        }
    }

    /// Handle every event already queued, without waiting.
    pub fn process_pending(&mut self) -> usize {
        let Some(mut rx) = self.events_rx.take() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        self.events_rx = Some(rx);
        handled
    }

    /// Run the event loop until shutdown.
    pub async fn run(&mut self) -> VoiceResult<()> {
        let mut rx = self
            .events_rx
            .take()
            .ok_or_else(|| VoiceError::Precondition("Event loop already running".to_string()))?;

        let period = Duration::from_millis(self.settings.sweep_interval_ms);
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.running = true;
        info!("🚀 Engine event loop started");
        while self.running {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = sweep.tick() => self.handle_event(EngineEvent::Tick),
            }
        }
        info!("🛑 Engine event loop ended");

        self.events_rx = Some(rx);
        Ok(())
    }
}

impl<C, M, O> Drop for VoiceEngine<C, M, O> {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }
}

fn event_name(event: &ChannelEvent) -> &'static str {
    match event {
        ChannelEvent::Opened => "open",
        ChannelEvent::Message(_) => "message",
        ChannelEvent::Error(_) => "error",
        ChannelEvent::Closed(_) => "close",
    }
}
