//! The single outward connection shared by every worker.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::MuxError, message::Message};

pub mod memory;
pub mod ws;

pub use memory::{MemoryConnector, MemoryPeer, memory_channel};
pub use ws::{WsChannel, WsConnector};

#[async_trait]
pub trait OutwardChannel: Send + Sync {
    /// Send one message. Returns once it has been handed to the transport
    /// in full.
    async fn send(&self, msg: Message) -> Result<(), MuxError>;

    /// Wait for the next inbound message.
    ///
    /// Returns `Ok(None)` once the counterpart has closed the connection.
    /// Frames that are not JSON objects are logged and skipped.
    async fn receive(&self) -> Result<Option<Message>, MuxError>;

    async fn close(&self) -> Result<(), MuxError>;
}

/// Opens an [`OutwardChannel`]. Failing here is a [`MuxError::Connect`].
#[async_trait]
pub trait OutwardConnector: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn OutwardChannel>, MuxError>;
}
