use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message as WsMsg},
};
use tracing::{debug, info, warn};

use super::{OutwardChannel, OutwardConnector};
use crate::{error::MuxError, message::Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl OutwardConnector for WsConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Arc<dyn OutwardChannel>, MuxError> {
        info!(endpoint = %self.endpoint, "connecting");
        let (stream, _response) =
            connect_async(self.endpoint.as_str())
                .await
                .map_err(|e| MuxError::Connect {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })?;
        info!(endpoint = %self.endpoint, "connected");
        Ok(Arc::new(WsChannel::new(self.endpoint.clone(), stream)))
    }
}

/// One text frame per JSON message.
pub struct WsChannel {
    endpoint: String,
    sink: Mutex<SplitSink<WsStream, WsMsg>>,
    source: Mutex<SplitStream<WsStream>>,
    peer_closed: AtomicBool,
}

impl WsChannel {
    fn new(endpoint: String, stream: WsStream) -> Self {
        let (sink, source) = stream.split();
        Self {
            endpoint,
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            peer_closed: AtomicBool::new(false),
        }
    }

    fn parse_frame(&self, text: &str) -> Option<Message> {
        match Message::parse(text) {
            Ok(msg) => Some(msg),
            Err(reason) => {
                let err = MuxError::MalformedMessage {
                    origin: self.endpoint.clone(),
                    reason,
                };
                warn!(error = %err, "dropping inbound frame");
                None
            }
        }
    }
}

#[async_trait]
impl OutwardChannel for WsChannel {
    async fn send(&self, msg: Message) -> Result<(), MuxError> {
        let text = msg.to_json()?;
        self.sink
            .lock()
            .await
            .send(WsMsg::text(text))
            .await
            .map_err(|e| MuxError::Channel(e.to_string()))
    }

    async fn receive(&self) -> Result<Option<Message>, MuxError> {
        let mut source = self.source.lock().await;
        loop {
            match source.next().await {
                None => {
                    self.peer_closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => return Err(MuxError::Channel(e.to_string())),
                Some(Ok(WsMsg::Text(text))) => {
                    if let Some(msg) = self.parse_frame(text.as_str()) {
                        return Ok(Some(msg));
                    }
                }
                Some(Ok(WsMsg::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if let Some(msg) = self.parse_frame(text) {
                            return Ok(Some(msg));
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "dropping non UTF-8 frame")
                    }
                },
                Some(Ok(WsMsg::Close(frame))) => {
                    info!(endpoint = %self.endpoint, ?frame, "counterpart closed the connection");
                    self.peer_closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                // ping / pong are answered by tungstenite
                Some(Ok(other)) => debug!(endpoint = %self.endpoint, ?other, "control frame"),
            }
        }
    }

    async fn close(&self) -> Result<(), MuxError> {
        let result = self.sink.lock().await.close().await;
        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            // the counterpart may drop the socket right after its close frame
            Err(e) if self.peer_closed.load(Ordering::SeqCst) => {
                debug!(endpoint = %self.endpoint, error = %e, "close after counterpart hang up");
                Ok(())
            }
            Err(e) => Err(MuxError::Channel(e.to_string())),
        }
    }
}
