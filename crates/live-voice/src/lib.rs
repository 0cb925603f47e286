//! # Live Voice - Real-time Voice Conversation Client
//!
//! Streams microphone audio to a remote conversational service over a
//! persistent channel and plays the audio replies back gaplessly, cutting
//! playback the moment the service reports that the user spoke over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Voice Engine                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │   Capture    │→ │  PCM16 codec │→ │   Channel    │ ───→ │ service
//! │  │    (cpal)    │  │   (16 kHz)   │  │ (websocket)  │ ←─── │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! │         ↑ epoch           single event queue  ↓ generation  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//! │  │   Output     │← │  Scheduler   │← │ PCM16 decode │      │
//! │  │   (rodio)    │  │ (next start) │  │   (24 kHz)   │      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All state changes happen on the engine's event loop. Transports and audio
//! devices only post events; see [`engine`].

pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod tap;
pub mod websocket;

pub use capture::{CapturePipeline, CaptureStream, CpalMicrophone, FrameSink, Microphone};
pub use channel::{
    ChannelConnector, ChannelEvent, ChannelEvents, ChannelHandle, InboundAudio, OutboundChunk,
    ServerMessage,
};
pub use codec::DecodedAudio;
pub use config::{AudioSettings, EndpointConfig, LiveConfig, SessionConfig};
pub use engine::{EngineCommand, EngineEvent, EngineHandle, EngineNotice, VoiceEngine};
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use output::{AudioOutput, PlaybackId, RodioOutput, Timeline, TimelineSource};
pub use scheduler::{InboundSegment, PlaybackScheduler, ScheduledPlayback};
pub use session::{Generation, Session, SessionState};
pub use tap::AudioTap;
pub use websocket::WsConnector;
