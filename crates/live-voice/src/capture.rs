//! Microphone capture.
//!
//! The device callback slices input into fixed-size frames and posts each one
//! to the engine queue tagged with the capture epoch. The engine decides
//! whether a frame is still wanted; the capture side never buffers beyond the
//! frame being filled.

use crate::channel::OutboundChunk;
use crate::codec;
use crate::engine::EngineEvent;
use crate::error::{VoiceError, VoiceResult};
use crate::session::Generation;
use crate::tap::AudioTap;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Posts captured frames into the engine queue.
#[derive(Debug, Clone)]
pub struct FrameSink {
    epoch: Generation,
    tx: mpsc::UnboundedSender<EngineEvent>,
    tap: Option<AudioTap>,
}

impl FrameSink {
    pub fn new(
        epoch: Generation,
        tx: mpsc::UnboundedSender<EngineEvent>,
        tap: Option<AudioTap>,
    ) -> Self {
        Self { epoch, tx, tap }
    }

    /// Returns false once the engine has gone away.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        if let Some(ref tap) = self.tap {
            tap.publish(&samples);
        }
        self.tx
            .send(EngineEvent::CaptureFrame {
                epoch: self.epoch,
                samples,
            })
            .is_ok()
    }

    /// Report a device failure after the stream was opened.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx
            .send(EngineEvent::CaptureFailed {
                epoch: self.epoch,
                message: message.into(),
            })
            .is_ok()
    }
}

/// An open microphone stream. Closing releases the device.
pub trait CaptureStream {
    fn close(&mut self);
}

/// Source of microphone audio.
pub trait Microphone {
    /// Open the device and start delivering mono frames of exactly
    /// `frame_size` samples at `sample_rate` to `sink`.
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
        sink: FrameSink,
    ) -> VoiceResult<Box<dyn CaptureStream>>;
}

/// Owns at most one open microphone stream and converts its frames for the wire.
pub struct CapturePipeline<M> {
    mic: M,
    sample_rate: u32,
    frame_size: usize,
    epoch: Generation,
    stream: Option<Box<dyn CaptureStream>>,
}

impl<M: Microphone> CapturePipeline<M> {
    pub fn new(mic: M, sample_rate: u32, frame_size: usize) -> Self {
        Self {
            mic,
            sample_rate,
            frame_size,
            epoch: Generation::default(),
            stream: None,
        }
    }

    /// Open the microphone. Starting an already running pipeline is a no-op.
    pub fn start(
        &mut self,
        tx: mpsc::UnboundedSender<EngineEvent>,
        tap: Option<AudioTap>,
    ) -> VoiceResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let epoch = self.epoch.next();
        let sink = FrameSink::new(epoch, tx, tap);
        let stream = self.mic.open(self.sample_rate, self.frame_size, sink)?;
        self.epoch = epoch;
        self.stream = Some(stream);
        info!("🎤 Capture started ({} samples/frame, epoch {})", self.frame_size, epoch);
        Ok(())
    }

    /// Release the microphone. Stopping a stopped pipeline is a no-op.
    pub fn stop(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.close();
                // frames already queued under this epoch must not be sent
                self.epoch = self.epoch.next();
                info!("Capture stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether a frame tagged `epoch` came from the stream that is open now.
    pub fn accepts(&self, epoch: Generation) -> bool {
        self.stream.is_some() && self.epoch == epoch
    }

    pub fn encode(&self, samples: &[f32]) -> OutboundChunk {
        OutboundChunk {
            pcm: codec::encode(samples),
            sample_rate: self.sample_rate,
        }
    }

}

impl<M> Drop for CapturePipeline<M> {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

/// Default input device via CPAL.
#[derive(Debug, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the input device with this name over the host default.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    fn device(&self) -> VoiceResult<Device> {
        let host = cpal::default_host();
        if let Some(ref wanted) = self.device_name {
            for device in host.input_devices()? {
                if device.name().map(|n| &n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
            warn!("Input device '{}' not found, using default", wanted);
        }
        host.default_input_device()
            .ok_or_else(|| VoiceError::Device("No input device available".to_string()))
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

impl Microphone for CpalMicrophone {
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
        sink: FrameSink,
    ) -> VoiceResult<Box<dyn CaptureStream>> {
        let device = self.device()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("📱 Using input device: {}", name);

        let default_config = device.default_input_config()?;
        debug!("Default input config: {:?}", default_config);

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = stream_config.channels as usize;

        let mut frame = Vec::with_capacity(frame_size);
        let error_sink = sink.clone();

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // first channel only
                for &sample in data.iter().step_by(channels) {
                    frame.push(sample);
                    if frame.len() == frame_size {
                        let full = std::mem::replace(&mut frame, Vec::with_capacity(frame_size));
                        sink.push(full);
                    }
                }
            },
            move |err| {
                warn!("Audio input stream error: {}", err);
                error_sink.fail(err.to_string());
            },
            None,
        )?;

        stream.play()?;

        Ok(Box::new(CpalCaptureStream {
            stream: Some(stream),
        }))
    }
}

struct CpalCaptureStream {
    stream: Option<Stream>,
}

impl CaptureStream for CpalCaptureStream {
    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing input stream failed: {}", e);
            }
            // dropping the stream releases the device and the callback's sink
            drop(stream);
        }
    }
}
