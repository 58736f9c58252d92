//! In-process outward channel. The [`MemoryPeer`] plays the external
//! counterpart: it injects inbound messages and sees everything sent out.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{
    Mutex,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tokio_util::sync::CancellationToken;

use super::{OutwardChannel, OutwardConnector};
use crate::{error::MuxError, message::Message};

struct Shared {
    inbound: Mutex<UnboundedReceiver<Message>>,
    outbound: UnboundedSender<Message>,
    hangup: CancellationToken,
    closed: CancellationToken,
}

/// Build a connected connector / peer pair.
pub fn memory_channel() -> (MemoryConnector, MemoryPeer) {
    let (in_tx, in_rx) = unbounded_channel();
    let (out_tx, out_rx) = unbounded_channel();
    let shared = Arc::new(Shared {
        inbound: Mutex::new(in_rx),
        outbound: out_tx,
        hangup: CancellationToken::new(),
        closed: CancellationToken::new(),
    });
    (
        MemoryConnector {
            shared: shared.clone(),
            refuse: Arc::new(AtomicBool::new(false)),
        },
        MemoryPeer {
            inbound: in_tx,
            outbound: out_rx,
            shared,
        },
    )
}

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    refuse: Arc<AtomicBool>,
}

impl MemoryConnector {
    /// Make the next `connect` fail like an unreachable endpoint.
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutwardConnector for MemoryConnector {
    fn endpoint(&self) -> &str {
        "memory://local"
    }

    async fn connect(&self) -> Result<Arc<dyn OutwardChannel>, MuxError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(MuxError::Connect {
                endpoint: self.endpoint().to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
}

#[async_trait]
impl OutwardChannel for MemoryChannel {
    async fn send(&self, msg: Message) -> Result<(), MuxError> {
        if self.shared.closed.is_cancelled() {
            return Err(MuxError::Channel("channel is closed".to_string()));
        }
        self.shared
            .outbound
            .send(msg)
            .map_err(|_| MuxError::Channel("peer is gone".to_string()))
    }

    async fn receive(&self) -> Result<Option<Message>, MuxError> {
        let mut inbound = self.shared.inbound.lock().await;
        tokio::select! {
            _ = self.shared.hangup.cancelled() => Ok(None),
            msg = inbound.recv() => Ok(msg),
        }
    }

    async fn close(&self) -> Result<(), MuxError> {
        self.shared.closed.cancel();
        Ok(())
    }
}

/// The far end of a [`memory_channel`].
pub struct MemoryPeer {
    inbound: UnboundedSender<Message>,
    outbound: UnboundedReceiver<Message>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Deliver a message to the multiplexer as if it came over the wire.
    pub fn send(&self, msg: Message) -> bool {
        self.inbound.send(msg).is_ok()
    }

    /// Next message the multiplexer sent out.
    pub async fn recv(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Message> {
        tokio::time::timeout(wait, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Close the connection from the far side.
    pub fn hang_up(&self) {
        self.shared.hangup.cancel();
    }

    /// Whether the multiplexer closed its side.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}
