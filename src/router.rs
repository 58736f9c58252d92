use std::sync::Arc;

use tracing::{Level, event, warn};

use crate::{
    error::MuxError,
    logger::ROUTING_TARGET,
    message::Message,
    outward::OutwardChannel,
    registry::{WorkerInput, WorkerRegistry},
};

/// Where an inbound message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered to the worker named by the tag.
    Direct(String),
    /// No usable tag; these running workers got a copy.
    Broadcast(Vec<String>),
}

impl Delivery {
    pub fn recipients(&self) -> Vec<String> {
        match self {
            Delivery::Direct(name) => vec![name.clone()],
            Delivery::Broadcast(names) => names.clone(),
        }
    }
}

/// Tags worker output on the way out and picks recipients on the way in.
#[derive(Clone)]
pub struct Router {
    registry: WorkerRegistry,
    outward: Arc<dyn OutwardChannel>,
}

impl Router {
    pub fn new(registry: WorkerRegistry, outward: Arc<dyn OutwardChannel>) -> Self {
        Self { registry, outward }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Tag `msg` with its origin and forward it. An error here means the
    /// outward channel itself failed.
    pub async fn route_outbound(&self, worker: &str, msg: Message) -> Result<(), MuxError> {
        let msg = msg.tagged(worker);
        self.outward.send(msg).await?;
        event!(
            target: ROUTING_TARGET,
            Level::DEBUG,
            direction = "outbound",
            worker,
            "forwarded"
        );
        Ok(())
    }

    /// Deliver to the tagged worker when it is running, otherwise to every
    /// running worker. Never waits on a worker; one that is not keeping up
    /// is logged and skipped.
    pub fn route_inbound(&self, msg: Message) -> Delivery {
        if let Some(name) = msg.tag() {
            if let Some(input) = self.registry.running_input(name) {
                let name = name.to_string();
                let delivered = deliver(&input, msg.clone());
                event!(
                    target: ROUTING_TARGET,
                    Level::DEBUG,
                    direction = "inbound",
                    worker = %name,
                    delivered,
                    "direct"
                );
                return Delivery::Direct(name);
            }
            warn!(worker = %name, "tagged worker is not running, broadcasting");
        }

        let mut reached = Vec::new();
        for (name, input) in self.registry.running_inputs() {
            if deliver(&input, msg.clone()) {
                reached.push(name);
            }
        }
        event!(
            target: ROUTING_TARGET,
            Level::DEBUG,
            direction = "inbound",
            delivered = reached.len(),
            "broadcast"
        );
        Delivery::Broadcast(reached)
    }
}

fn deliver(input: &WorkerInput, msg: Message) -> bool {
    match input.send(msg) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "delivery failed");
            false
        }
    }
}
