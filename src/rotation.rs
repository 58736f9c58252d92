//! Rotation mode: one worker at a time, each for a bounded slice, forever.
//!
//! Rotation workers talk to the outside world themselves (they inherit the
//! environment, endpoint included), so the scheduler only owns their
//! lifetime and logs what they print.

use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use tokio::{
    sync::broadcast,
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::MuxError,
    worker::{LogStream, Worker, WorkerSpec, spawn_log_drain},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEntry {
    pub spec: WorkerSpec,
    pub duration: Duration,
}

impl RotationEntry {
    pub fn new(spec: WorkerSpec, duration: Duration) -> Self {
        Self { spec, duration }
    }
}

/// Ordered, non-empty and fixed once built.
#[derive(Debug, Clone)]
pub struct RotationTable {
    entries: Vec<RotationEntry>,
}

impl RotationTable {
    pub fn new(entries: Vec<RotationEntry>) -> Result<Self, MuxError> {
        if entries.is_empty() {
            return Err(MuxError::Config("rotation table is empty".to_string()));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RotationEntry> {
        self.entries.get(index)
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.entries.len()
    }

    pub fn entries(&self) -> &[RotationEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationEvent {
    Started {
        index: usize,
        name: String,
        pid: Option<u32>,
    },
    /// The worker ended on its own before its slice was over.
    Exited {
        index: usize,
        name: String,
        code: Option<i32>,
    },
    /// The worker was terminated at its deadline or on cancellation.
    Stopped { index: usize, name: String },
    SpawnFailed { index: usize, name: String },
}

/// Stand-in deadline for slices too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn slice_deadline(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

enum SliceEnd {
    Exited(Option<i32>),
    Deadline,
    Cancelled,
}

pub struct RotationScheduler {
    table: RotationTable,
    gap: Duration,
    grace: Duration,
    current: AtomicCell<usize>,
    events: broadcast::Sender<RotationEvent>,
}

impl RotationScheduler {
    pub fn new(table: RotationTable, gap: Duration, grace: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            table,
            gap,
            grace,
            current: AtomicCell::new(0),
            events,
        }
    }

    pub fn table(&self) -> &RotationTable {
        &self.table
    }

    /// Index of the entry currently running, or about to run after the gap.
    pub fn current_index(&self) -> usize {
        self.current.load()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RotationEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Walk the table until `cancel` fires. The active worker is always
    /// terminated before this returns, and before the next one starts.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut index = 0;
        loop {
            self.current.store(index);
            let Some(entry) = self.table.get(index) else {
                return;
            };

            if self.run_slice(index, entry, &cancel).await {
                info!("rotation cancelled");
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rotation cancelled during gap");
                    return;
                }
                _ = sleep(self.gap) => {}
            }
            index = self.table.next_index(index);
        }
    }

    /// Returns true when the slice ended because of cancellation.
    async fn run_slice(
        &self,
        index: usize,
        entry: &RotationEntry,
        cancel: &CancellationToken,
    ) -> bool {
        let name = entry.spec.name.clone();
        let (mut worker, pipes) = match Worker::start_detached(&entry.spec) {
            Ok(started) => started,
            Err(e) => {
                error!(worker = %name, error = %e, "rotation worker failed to start, skipping");
                self.publish(RotationEvent::SpawnFailed { index, name });
                return cancel.is_cancelled();
            }
        };

        info!(
            worker = %name,
            index,
            duration_secs = entry.duration.as_secs_f64(),
            "rotation slice started"
        );
        self.publish(RotationEvent::Started {
            index,
            name: name.clone(),
            pid: worker.pid(),
        });
        spawn_log_drain(name.clone(), LogStream::Stdout, pipes.stdout);
        spawn_log_drain(name.clone(), LogStream::Stderr, pipes.stderr);

        let deadline = slice_deadline(Instant::now(), entry.duration);
        let end = tokio::select! {
            _ = cancel.cancelled() => SliceEnd::Cancelled,
            _ = sleep_until(deadline) => SliceEnd::Deadline,
            res = worker.wait() => match res {
                Ok(status) => SliceEnd::Exited(status.and_then(|s| s.code())),
                Err(e) => {
                    warn!(worker = %name, error = %e, "lost track of worker, stopping it");
                    SliceEnd::Deadline
                }
            },
        };

        let cancelled = matches!(end, SliceEnd::Cancelled);
        match end {
            SliceEnd::Exited(code) => {
                warn!(worker = %name, ?code, "rotation worker exited before its slice ended");
                self.publish(RotationEvent::Exited { index, name, code });
                false
            }
            SliceEnd::Deadline | SliceEnd::Cancelled => {
                if let Err(e) = worker.terminate(self.grace).await {
                    error!(worker = %name, error = %e, "termination failed");
                }
                self.publish(RotationEvent::Stopped { index, name });
                cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, script: &str, millis: u64) -> RotationEntry {
        RotationEntry::new(
            WorkerSpec::new(name, ["sh", "-c", script]),
            Duration::from_millis(millis),
        )
    }

    #[test]
    fn test_empty_table_is_rejected() {
        assert!(matches!(RotationTable::new(vec![]), Err(MuxError::Config(_))));
    }

    #[test]
    fn test_next_index_wraps() {
        let table = RotationTable::new(vec![
            entry("a", "true", 1),
            entry("b", "true", 1),
            entry("c", "true", 1),
        ])
        .unwrap();
        assert_eq!(table.next_index(0), 1);
        assert_eq!(table.next_index(2), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cycle_order_one_at_a_time() {
        let table = RotationTable::new(vec![
            entry("S1", "sleep 30", 300),
            entry("S2", "sleep 30", 300),
        ])
        .unwrap();
        let sched = std::sync::Arc::new(RotationScheduler::new(
            table,
            Duration::from_millis(50),
            Duration::from_millis(500),
        ));
        let mut events = sched.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let sched = sched.clone();
            let cancel = cancel.clone();
            async move { sched.run(cancel).await }
        });

        let mut seen = Vec::new();
        while seen.len() < 5 {
            match events.recv().await.unwrap() {
                RotationEvent::Started { index, .. } => seen.push(format!("start {index}")),
                RotationEvent::Stopped { index, .. } => seen.push(format!("stop {index}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(seen, vec!["start 0", "stop 0", "start 1", "stop 1", "start 0"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_and_spawn_failure_advance() {
        let table = RotationTable::new(vec![
            entry("quick", "exit 4", 5_000),
            RotationEntry::new(
                WorkerSpec::new("ghost", ["/definitely/not/here"]),
                Duration::from_secs(5),
            ),
            entry("last", "sleep 30", 5_000),
        ])
        .unwrap();
        let sched = std::sync::Arc::new(RotationScheduler::new(
            table,
            Duration::from_millis(20),
            Duration::from_millis(500),
        ));
        let mut events = sched.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let sched = sched.clone();
            let cancel = cancel.clone();
            async move { sched.run(cancel).await }
        });

        assert!(matches!(events.recv().await.unwrap(), RotationEvent::Started { index: 0, .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            RotationEvent::Exited {
                index: 0,
                name: "quick".into(),
                code: Some(4)
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RotationEvent::SpawnFailed {
                index: 1,
                name: "ghost".into()
            }
        );
        let pid = match events.recv().await.unwrap() {
            RotationEvent::Started { index: 2, pid, .. } => pid.unwrap(),
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(sched.current_index(), 2);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RotationEvent::Stopped {
                index: 2,
                name: "last".into()
            }
        );

        // reaped: signal 0 reports no such process
        let signal_zero = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert!(signal_zero.is_err());
    }

    #[test]
    fn test_unrepresentable_slice_gets_a_far_deadline() {
        let now = Instant::now();
        assert_eq!(
            slice_deadline(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
        assert_eq!(slice_deadline(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_huge_slice_runs_until_cancelled() {
        let table = RotationTable::new(vec![RotationEntry::new(
            WorkerSpec::new("forever", ["sleep", "30"]),
            Duration::from_secs(u64::MAX),
        )])
        .unwrap();
        let sched = std::sync::Arc::new(RotationScheduler::new(
            table,
            Duration::from_millis(20),
            Duration::from_millis(500),
        ));
        let mut events = sched.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let sched = sched.clone();
            let cancel = cancel.clone();
            async move { sched.run(cancel).await }
        });

        assert!(matches!(events.recv().await.unwrap(), RotationEvent::Started { index: 0, .. }));
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RotationEvent::Stopped {
                index: 0,
                name: "forever".into()
            }
        );
    }
}
