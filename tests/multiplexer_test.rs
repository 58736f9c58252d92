#![cfg(unix)]

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::{
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

use toolmux::{
    Message, MuxError,
    outward::{MemoryPeer, memory_channel},
    supervisor::{ShutdownReason, Supervisor, SupervisorConfig, SupervisorState},
    worker::{WorkerSpec, WorkerStatus},
};

const QUIET: Duration = Duration::from_millis(300);

fn msg(v: Value) -> Message {
    Message::try_from(v).unwrap()
}

fn sh(name: &str, script: &str) -> WorkerSpec {
    WorkerSpec::new(name, ["sh", "-c", script])
}

fn echo(name: &str) -> WorkerSpec {
    WorkerSpec::new(name, ["cat"])
}

struct Running {
    supervisor: Arc<Supervisor>,
    peer: MemoryPeer,
    cancel: CancellationToken,
    handle: JoinHandle<Result<ShutdownReason, MuxError>>,
}

impl Running {
    async fn start(workers: Vec<WorkerSpec>) -> Self {
        Self::start_with_grace(workers, Duration::from_millis(300)).await
    }

    async fn start_with_grace(workers: Vec<WorkerSpec>, grace_period: Duration) -> Self {
        let (connector, peer) = memory_channel();
        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig {
                workers: workers.clone(),
                grace_period,
            },
            Arc::new(connector),
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let supervisor = supervisor.clone();
            let cancel = cancel.clone();
            async move { supervisor.run(cancel).await }
        });

        // every configured worker shows up in the registry once started
        let registry = supervisor.registry();
        timeout(Duration::from_secs(5), async {
            while registry.len() < workers.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workers did not start");

        Self {
            supervisor,
            peer,
            cancel,
            handle,
        }
    }

    async fn next_out(&mut self) -> Value {
        let out = self
            .peer
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("no outbound message");
        serde_json::to_value(out).unwrap()
    }

    async fn assert_quiet(&mut self) {
        assert_eq!(self.peer.recv_timeout(QUIET).await, None);
    }

    async fn wait_for_status(&self, name: &str, status: WorkerStatus) {
        let registry = self.supervisor.registry();
        timeout(Duration::from_secs(5), async {
            while registry.status(name) != Some(status) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{name} never became {status}"));
    }

    async fn stop(self) -> (ShutdownReason, Arc<Supervisor>, MemoryPeer) {
        self.cancel.cancel();
        let reason = timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("shutdown hung")
            .unwrap()
            .unwrap();
        (reason, self.supervisor, self.peer)
    }
}

#[tokio::test]
async fn test_worker_output_is_tagged() {
    let mut mux = Running::start(vec![sh("w", r#"echo '{"a":1}'; exec sleep 30"#)]).await;
    assert_eq!(mux.next_out().await, json!({"a": 1, "_server": "w"}));
    mux.stop().await;
}

#[tokio::test]
async fn test_malformed_worker_lines_are_dropped() {
    let mut mux = Running::start(vec![sh(
        "w",
        r#"echo 'starting up'; echo '[1,2]'; echo '{"ok":true}'; exec sleep 30"#,
    )])
    .await;
    assert_eq!(mux.next_out().await, json!({"ok": true, "_server": "w"}));
    mux.assert_quiet().await;
    assert_eq!(
        mux.supervisor.registry().status("w"),
        Some(WorkerStatus::Running)
    );
    mux.stop().await;
}

#[tokio::test]
async fn test_tagged_inbound_goes_to_one_worker_untagged_to_all() {
    let mut mux = Running::start(vec![echo("A"), echo("B")]).await;

    assert!(mux.peer.send(msg(json!({"_server": "A", "id": 1}))));
    assert_eq!(mux.next_out().await, json!({"_server": "A", "id": 1}));
    mux.assert_quiet().await;

    assert!(mux.peer.send(msg(json!({"id": 2}))));
    let mut tags = vec![
        mux.next_out().await["_server"].clone(),
        mux.next_out().await["_server"].clone(),
    ];
    tags.sort_by_key(|v| v.to_string());
    assert_eq!(tags, vec![json!("A"), json!("B")]);
    mux.assert_quiet().await;

    mux.stop().await;
}

#[tokio::test]
async fn test_inbound_order_is_preserved_per_worker() {
    let mut mux = Running::start(vec![echo("A")]).await;
    for id in 0..20 {
        assert!(mux.peer.send(msg(json!({"_server": "A", "id": id}))));
    }
    for id in 0..20 {
        assert_eq!(mux.next_out().await["id"], json!(id));
    }
    mux.stop().await;
}

#[tokio::test]
async fn test_crashed_worker_is_skipped_by_broadcast() {
    let mut mux = Running::start(vec![sh("A", "exit 1"), echo("B")]).await;
    mux.wait_for_status("A", WorkerStatus::Stopped).await;
    assert_eq!(*mux.supervisor.state().borrow(), SupervisorState::Running);

    assert!(mux.peer.send(msg(json!({"id": 3}))));
    assert_eq!(mux.next_out().await, json!({"id": 3, "_server": "B"}));
    mux.assert_quiet().await;

    // a tag naming the dead worker falls back to the live one
    assert!(mux.peer.send(msg(json!({"_server": "A", "id": 4}))));
    assert_eq!(mux.next_out().await, json!({"id": 4, "_server": "B"}));

    mux.stop().await;
}

#[tokio::test]
async fn test_unknown_tag_broadcasts() {
    let mut mux = Running::start(vec![echo("A")]).await;
    assert!(mux.peer.send(msg(json!({"_server": "nobody", "id": 5}))));
    assert_eq!(mux.next_out().await, json!({"id": 5, "_server": "A"}));
    mux.stop().await;
}

#[tokio::test]
async fn test_cancellation_stops_workers_and_closes_channel() {
    let mux = Running::start(vec![
        echo("polite"),
        sh("stubborn", "trap '' TERM; while true; do sleep 1; done"),
    ])
    .await;
    // let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (reason, supervisor, peer) = mux.stop().await;
    assert_eq!(reason, ShutdownReason::Cancelled);
    assert!(peer.is_closed());
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Terminated);

    let diagnostics = supervisor.registry().diagnostics();
    assert_eq!(diagnostics.get("polite"), Some(&WorkerStatus::Stopped));
    assert_eq!(diagnostics.get("stubborn"), Some(&WorkerStatus::Stopped));
}

#[tokio::test]
async fn test_shutdown_closes_stdin_before_signalling() {
    // ignores SIGTERM, so only end of input lets it go before the grace period
    let mux = Running::start_with_grace(
        vec![sh("reader", "trap '' TERM; cat >/dev/null")],
        Duration::from_secs(5),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let (reason, supervisor, _peer) = mux.stop().await;
    assert_eq!(reason, ShutdownReason::Cancelled);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "worker waited out the grace period: {:?}",
        started.elapsed()
    );
    assert_eq!(
        supervisor.registry().status("reader"),
        Some(WorkerStatus::Stopped)
    );
}

#[tokio::test]
async fn test_closed_stderr_does_not_stop_worker() {
    let mut mux = Running::start(vec![sh("quiet", "exec 2>&-; exec cat")]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        mux.supervisor.registry().status("quiet"),
        Some(WorkerStatus::Running)
    );

    assert!(mux.peer.send(msg(json!({"_server": "quiet", "id": 6}))));
    assert_eq!(mux.next_out().await, json!({"_server": "quiet", "id": 6}));
    mux.stop().await;
}

#[tokio::test]
async fn test_counterpart_hang_up_ends_run() {
    let mux = Running::start(vec![echo("A")]).await;
    mux.peer.hang_up();

    let reason = timeout(Duration::from_secs(10), mux.handle)
        .await
        .expect("shutdown hung")
        .unwrap()
        .unwrap();
    assert_eq!(reason, ShutdownReason::ChannelClosed);
    assert!(mux.peer.is_closed());
    assert_eq!(
        mux.supervisor.registry().status("A"),
        Some(WorkerStatus::Stopped)
    );
}

#[tokio::test]
async fn test_connect_error_starts_nothing() {
    let (connector, _peer) = memory_channel();
    connector.refuse_connections();
    let supervisor = Supervisor::new(
        SupervisorConfig {
            workers: vec![echo("A"), echo("B")],
            grace_period: Duration::from_millis(300),
        },
        Arc::new(connector),
    );

    let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MuxError::Connect { .. }));
    assert!(supervisor.registry().is_empty());
}
