//! WebSocket transport for the live conversation service.
//!
//! An open attempt runs in its own task: connect, send the setup message,
//! then split the stream into a sender task fed from an unbounded queue and a
//! receiver loop that turns server frames into [`ChannelEvent`]s. The channel
//! counts as open when the service acknowledges the setup.
//!
//! [`ChannelEvent`]: crate::channel::ChannelEvent

use crate::channel::{
    ChannelConnector, ChannelEvents, ChannelHandle, OutboundChunk, ServerMessage,
};
use crate::config::{EndpointConfig, SessionConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{self, ClientMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a locally closed channel waits for the server's close reply
/// before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens sessions against a WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: EndpointConfig,
}

impl WsConnector {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self { endpoint }
    }
}

/// Endpoint URL with the API key attached as the `key` query parameter.
pub fn request_url(endpoint: &EndpointConfig) -> VoiceResult<String> {
    let key = endpoint
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| VoiceError::Connection("API key not configured".to_string()))?;
    let separator = if endpoint.url.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}key={}", endpoint.url, separator, key))
}

impl ChannelConnector for WsConnector {
    fn open(
        &mut self,
        session: &SessionConfig,
        events: ChannelEvents,
    ) -> VoiceResult<Box<dyn ChannelHandle>> {
        session.validate()?;
        let url = request_url(&self.endpoint)?;
        let setup = ClientMessage::setup(session).to_json()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Connection(format!("No async runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let established = Arc::new(AtomicBool::new(false));
        let task = runtime.spawn(run_channel(
            url,
            setup,
            rx,
            events,
            Arc::clone(&established),
        ));

        Ok(Box::new(WsChannelHandle {
            tx: Some(tx),
            task: Some(task),
            established,
        }))
    }
}

async fn run_channel(
    url: String,
    setup: String,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: ChannelEvents,
    established: Arc<AtomicBool>,
) {
    info!(generation = %events.generation(), "🔌 Connecting to {}", redact(&url));
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(v) => v,
        Err(e) => {
            error!("WebSocket connection failed: {}", e);
            events.error(format!("Connection failed: {}", e));
            return;
        }
    };
    established.store(true, Ordering::Release);

    let (mut write, read) = ws_stream.split();
    if let Err(e) = write.send(Message::Text(setup)).await {
        events.error(format!("Failed to send setup: {}", e));
        return;
    }
    debug!("Setup sent; waiting for acknowledgement");

    tokio::spawn(sender_task(write, outbound));
    receiver_task(read, events).await;
}

/// Forwards queued messages. Ends after a close frame or when the handle is dropped.
async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            warn!("Failed to send WebSocket message: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
    debug!("WebSocket sender task ended");
}

async fn receiver_task(mut read: SplitStream<WsStream>, events: ChannelEvents) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatch(&text, &events),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => dispatch(&text, &events),
                Err(e) => warn!("Ignoring non-UTF-8 binary frame: {}", e),
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "Connection closed by server".to_string());
                info!("WebSocket closed: {}", reason);
                events.closed(reason);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                events.error(e.to_string());
                return;
            }
        }
    }
    events.closed("Connection ended");
}

fn dispatch(text: &str, events: &ChannelEvents) {
    let frame = match protocol::parse_server_frame(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("Dropping server frame: {}", e);
            return;
        }
    };
    if frame.setup_complete {
        events.opened();
    }
    for message in frame.messages {
        if message == ServerMessage::Other {
            trace!("Ignoring server frame with no audio content");
            continue;
        }
        events.message(message);
    }
}

fn redact(url: &str) -> &str {
    url.split_once("key=").map(|(base, _)| base).unwrap_or(url)
}

pub struct WsChannelHandle {
    tx: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
    established: Arc<AtomicBool>,
}

impl ChannelHandle for WsChannelHandle {
    fn send(&mut self, chunk: OutboundChunk) {
        let Some(ref tx) = self.tx else {
            return;
        };
        match ClientMessage::audio(&chunk).to_json() {
            Ok(json) => {
                if tx.send(Message::Text(json)).is_err() {
                    trace!("Channel gone; dropping {} samples", chunk.samples());
                }
            }
            Err(e) => warn!("Failed to encode outbound audio: {}", e),
        }
    }

    fn close(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let Some(mut task) = self.task.take() else {
            return;
        };
        if !self.established.load(Ordering::Acquire) {
            task.abort();
            debug!("WebSocket open attempt cancelled");
            return;
        }

        // the sender task flushes the close frame and exits
        let _ = tx.send(Message::Close(None));
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                        debug!("No close reply within {:?}; dropping socket", CLOSE_TIMEOUT);
                        task.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
        debug!("WebSocket channel closed locally");
    }
}

impl Drop for WsChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}
