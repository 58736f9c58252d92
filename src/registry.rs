use std::{collections::HashMap, io, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::AsyncWrite,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::MuxError,
    framer::LineWriter,
    message::Message,
    worker::{StatusCell, WorkerStatus},
};

/// Lines a worker may fall behind before deliveries to it are refused.
pub const INPUT_QUEUE: usize = 256;

/// Sending side of a worker's stdin.
///
/// Lines go through a queue to a writer task that owns the stream, so a
/// worker that stops reading only stalls its own queue. Clones share the
/// queue.
#[derive(Clone)]
pub struct WorkerInput {
    name: String,
    queue: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl WorkerInput {
    /// Start the writer task for `writer`. The stream is dropped, and the
    /// reader sees end of input, after [`WorkerInput::close`] or the first
    /// failed write.
    pub fn spawn<W>(name: &str, writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (queue, pending) = mpsc::channel(INPUT_QUEUE);
        let closed = CancellationToken::new();
        let task = tokio::spawn(write_lines(
            name.to_string(),
            LineWriter::new(writer),
            pending,
            closed.clone(),
        ));
        let input = Self {
            name: name.to_string(),
            queue,
            closed,
        };
        (input, task)
    }

    /// Queue `msg` without waiting on the worker.
    pub fn send(&self, msg: Message) -> Result<(), MuxError> {
        if self.closed.is_cancelled() {
            return Err(self.refused(io::ErrorKind::BrokenPipe, "stdin is closed"));
        }
        self.queue.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => self.refused(io::ErrorKind::WouldBlock, "stdin queue is full"),
            TrySendError::Closed(_) => self.refused(io::ErrorKind::BrokenPipe, "stdin is closed"),
        })
    }

    /// Stop writing and drop the stream. Lines still queued are discarded.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.queue.is_closed()
    }

    fn refused(&self, kind: io::ErrorKind, why: &str) -> MuxError {
        MuxError::Delivery {
            name: self.name.clone(),
            source: io::Error::new(kind, why),
        }
    }
}

async fn write_lines<W>(
    name: String,
    mut writer: LineWriter<W>,
    mut pending: mpsc::Receiver<Message>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = pending.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };
        let written = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            res = writer.write_message(&msg) => res,
        };
        if let Err(source) = written {
            let err = MuxError::Delivery {
                name: name.clone(),
                source,
            };
            warn!(worker = %name, error = %err, "closing stdin after failed write");
            break;
        }
    }
    debug!(worker = %name, "stdin closed");
}

#[derive(Clone)]
struct WorkerSlot {
    status: StatusCell,
    input: Option<WorkerInput>,
}

/// Name → worker map shared by the supervisor (writer) and router (reader).
///
/// Entries are only ever added or have their status flipped; a stopped
/// worker stays listed for diagnostics.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    slots: Arc<DashMap<String, WorkerSlot>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a started worker. Names are unique.
    pub fn register(
        &self,
        name: &str,
        status: StatusCell,
        input: Option<WorkerInput>,
    ) -> Result<(), MuxError> {
        match self.slots.entry(name.to_string()) {
            Entry::Occupied(_) => Err(MuxError::Config(format!(
                "worker `{name}` is already registered"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(WorkerSlot { status, input });
                Ok(())
            }
        }
    }

    /// Record a worker that never came up.
    pub fn register_failed(&self, name: &str) -> Result<(), MuxError> {
        self.register(name, StatusCell::new(WorkerStatus::Failed), None)
    }

    pub fn status(&self, name: &str) -> Option<WorkerStatus> {
        self.slots.get(name).map(|slot| slot.status.get())
    }

    pub fn set_status(&self, name: &str, status: WorkerStatus) {
        if let Some(slot) = self.slots.get(name) {
            slot.status.set(status);
        }
    }

    /// Input of `name` if that worker is currently running.
    pub fn running_input(&self, name: &str) -> Option<WorkerInput> {
        let slot = self.slots.get(name)?;
        if slot.status.get() != WorkerStatus::Running {
            return None;
        }
        slot.input.clone()
    }

    /// Snapshot of every running worker with an input, sorted by name.
    pub fn running_inputs(&self) -> Vec<(String, WorkerInput)> {
        let mut out: Vec<(String, WorkerInput)> = self
            .slots
            .iter()
            .filter(|kv| kv.value().status.get() == WorkerStatus::Running)
            .filter_map(|kv| {
                kv.value()
                    .input
                    .clone()
                    .map(|input| (kv.key().clone(), input))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Close every worker's stdin, running or not.
    pub fn close_inputs(&self) {
        for slot in self.slots.iter() {
            if let Some(input) = &slot.input {
                input.close();
            }
        }
    }

    /// Simple diagnostics: worker name → status
    pub fn diagnostics(&self) -> HashMap<String, WorkerStatus> {
        self.slots
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().status.get()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.iter().map(|kv| kv.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, duplex};

    fn msg(v: serde_json::Value) -> Message {
        Message::try_from(v).unwrap()
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let reg = WorkerRegistry::new();
        reg.register("a", StatusCell::new(WorkerStatus::Running), None)
            .unwrap();
        let err = reg
            .register("a", StatusCell::new(WorkerStatus::Running), None)
            .unwrap_err();
        assert!(matches!(err, MuxError::Config(_)));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_running_inputs_skip_stopped_and_failed() {
        let reg = WorkerRegistry::new();
        let (a, _a_rx) = duplex(64);
        let (b, _b_rx) = duplex(64);
        let (a, _) = WorkerInput::spawn("a", a);
        let (b, _) = WorkerInput::spawn("b", b);
        reg.register("a", StatusCell::new(WorkerStatus::Running), Some(a))
            .unwrap();
        reg.register("b", StatusCell::new(WorkerStatus::Running), Some(b))
            .unwrap();
        reg.register_failed("c").unwrap();

        reg.set_status("a", WorkerStatus::Stopped);

        let running: Vec<String> = reg.running_inputs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(running, vec!["b".to_string()]);
        assert!(reg.running_input("a").is_none());
        assert!(reg.running_input("c").is_none());
        assert_eq!(reg.diagnostics().get("c"), Some(&WorkerStatus::Failed));
        assert_eq!(reg.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_status_cell_is_shared_with_owner() {
        let reg = WorkerRegistry::new();
        let cell = StatusCell::new(WorkerStatus::Running);
        reg.register("w", cell.clone(), None).unwrap();
        cell.set(WorkerStatus::Stopped);
        assert_eq!(reg.status("w"), Some(WorkerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_queued_lines_arrive_in_order() {
        let (tx, mut rx) = duplex(1024);
        let (input, writer) = WorkerInput::spawn("w", tx);
        for id in 0..3 {
            input.send(msg(json!({"id": id}))).unwrap();
        }
        drop(input);
        writer.await.unwrap();

        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"id\":0}\n{\"id\":1}\n{\"id\":2}\n");
    }

    #[tokio::test]
    async fn test_close_ends_the_stream_and_refuses_sends() {
        let reg = WorkerRegistry::new();
        let (tx, mut rx) = duplex(64);
        let (input, writer) = WorkerInput::spawn("w", tx);
        reg.register("w", StatusCell::new(WorkerStatus::Running), Some(input.clone()))
            .unwrap();

        reg.close_inputs();
        writer.await.unwrap();

        // end of input reaches the reader even though a clone is still held
        let mut out = Vec::new();
        assert_eq!(rx.read_to_end(&mut out).await.unwrap(), 0);
        assert!(input.is_closed());
        let err = input.send(msg(json!({"late": true}))).unwrap_err();
        assert!(matches!(err, MuxError::Delivery { ref name, .. } if name == "w"));
    }

    #[tokio::test]
    async fn test_stalled_reader_fills_only_its_queue() {
        // nobody reads rx, so the writer blocks on the first full buffer
        let (tx, _rx) = duplex(16);
        let (input, _writer) = WorkerInput::spawn("slow", tx);

        let refused = (0..INPUT_QUEUE + 8)
            .map(|id| input.send(msg(json!({"id": id}))))
            .filter(|res| matches!(res, Err(MuxError::Delivery { .. })))
            .count();
        assert!(refused > 0);
        assert!(!input.is_closed());
    }
}
