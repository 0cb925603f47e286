//! Remote session channel contract.
//!
//! The engine never talks to the transport directly. A [`ChannelConnector`]
//! starts an open attempt and returns a [`ChannelHandle`]; everything the
//! transport observes afterwards (open, messages, errors, close) is posted back
//! into the engine's single event queue as a [`ChannelEvent`] tagged with the
//! generation of the attempt that produced it.

use crate::config::SessionConfig;
use crate::engine::EngineEvent;
use crate::error::VoiceResult;
use crate::session::Generation;
use tokio::sync::mpsc;
use tracing::debug;

/// One captured frame, already encoded for the wire. Discarded after send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundChunk {
    /// 16-bit signed little-endian mono PCM.
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

impl OutboundChunk {
    pub fn samples(&self) -> usize {
        self.pcm.len() / crate::codec::SAMPLE_WIDTH
    }
}

/// Audio payload as delivered by the envelope, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudio {
    /// Base64 PCM payload.
    pub data: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decoded meaning of one inbound server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Audio(InboundAudio),
    /// The user began speaking over playback.
    Interrupted,
    TurnComplete,
    /// Anything the engine does not act on.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(ServerMessage),
    Error(String),
    Closed(String),
}

/// Sender half given to a transport for one open attempt.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    generation: Generation,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEvents {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Post an event. Returns false once the engine has gone away.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        let sent = self
            .tx
            .send(EngineEvent::Channel {
                generation: self.generation,
                event,
            })
            .is_ok();
        if !sent {
            debug!(generation = %self.generation, "Engine gone; dropping channel event");
        }
        sent
    }

    pub fn opened(&self) -> bool {
        self.emit(ChannelEvent::Opened)
    }

    pub fn message(&self, message: ServerMessage) -> bool {
        self.emit(ChannelEvent::Message(message))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(ChannelEvent::Error(message.into()))
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(ChannelEvent::Closed(reason.into()))
    }
}

/// Live connection (or in-flight open attempt).
pub trait ChannelHandle {
    /// Fire-and-forget. The transport may buffer or drop under backpressure.
    fn send(&mut self, chunk: OutboundChunk);

    /// Idempotent. Cancels an open attempt that has not completed yet.
    fn close(&mut self);
}

/// Starts open attempts.
pub trait ChannelConnector {
    /// Begin opening a channel. Completion is reported through `events`
    /// (`Opened` or `Error`); an `Err` here means the attempt could not even start.
    fn open(
        &mut self,
        session: &SessionConfig,
        events: ChannelEvents,
    ) -> VoiceResult<Box<dyn ChannelHandle>>;
}
