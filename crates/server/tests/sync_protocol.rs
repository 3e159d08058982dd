//! Protocol properties exercised over a real listener with hand-built sync
//! bodies, the way a node would send them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use weft_core::config::ServerConfig;
use weft_core::{
    CancelSignal, CheckpointSink, NodeCapabilities, NodeId, RecordReader, RecordWriter, ServerId,
    SyncRequest, SyncResponse, Task, TaskEnvelope, TaskId, TaskRegistry,
};
use weft_server::{NodeEvent, ServeHandle, Server};

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    value: u64,
    target: u64,
}

#[async_trait]
impl Task for Counter {
    const KIND: &'static str = "it.counter";

    fn is_done(&self) -> bool {
        self.value >= self.target
    }

    async fn run(&self, _checkpoints: CheckpointSink, _cancel: CancelSignal) {}
}

fn counter(value: u64, target: u64) -> Counter {
    Counter { value, target }
}

fn registry() -> TaskRegistry {
    TaskRegistry::new().with::<Counter>().unwrap()
}

fn config(node_timeout: Duration) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".into(),
        node_timeout,
        ..ServerConfig::default()
    }
}

/// Minimal node speaking the wire protocol by hand.
struct Node {
    http: reqwest::Client,
    url: String,
    version: u32,
    node_id: Option<NodeId>,
    server_id: Option<ServerId>,
}

impl Node {
    fn new(handle: &ServeHandle) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/sync", handle.url()),
            version: weft_core::PROTOCOL_VERSION,
            node_id: None,
            server_id: None,
        }
    }

    async fn sync(&mut self, envelope: Option<TaskEnvelope>) -> (SyncResponse, TaskEnvelope) {
        let mut writer = RecordWriter::new();
        writer
            .write(&SyncRequest {
                version: self.version,
                server_id: self.server_id,
                capabilities: NodeCapabilities {
                    node_id: self.node_id,
                    ..NodeCapabilities::default()
                },
            })
            .unwrap();
        if let Some(env) = envelope {
            writer.write_envelope(&env).unwrap();
        }

        let resp = self.http.post(&self.url).body(writer.finish()).send().await.unwrap();
        assert!(resp.status().is_success(), "sync failed: {}", resp.status());
        let body = resp.bytes().await.unwrap();

        let mut reader = RecordReader::new(&body);
        let response: SyncResponse = reader.read().unwrap();
        let envelope = reader.read_envelope(&registry()).unwrap();
        if response.message != SyncResponse::MUST_UPGRADE {
            self.node_id = response.node_id;
            self.server_id = response.server_id;
        }
        (response, envelope)
    }
}

fn value(env: &TaskEnvelope) -> u64 {
    env.task
        .as_ref()
        .and_then(|t| t.downcast_ref::<Counter>())
        .map(|c| c.value)
        .unwrap()
}

#[tokio::test]
async fn resubmission_uses_last_checkpoint() {
    let server = Server::new(config(Duration::from_millis(150)), registry());
    let (handle, _feeds) = server.serve().await.unwrap();
    let mut sub = server.submit(counter(0, 100), false).await;

    let mut doomed = Node::new(&handle);
    let (_, env) = doomed.sync(None).await;
    let task_id = env.task_id.unwrap();
    assert_eq!(task_id, sub.id);

    for n in 1..=7 {
        let (resp, _) = doomed
            .sync(Some(TaskEnvelope::new(task_id, Arc::new(counter(n, 100)))))
            .await;
        assert_eq!(resp.message, SyncResponse::CONTINUE);
    }
    for n in 1..=7 {
        let cp = sub.checkpoints.recv().await.unwrap();
        assert_eq!(cp.downcast_ref::<Counter>().unwrap().value, n);
    }

    // The node goes silent; a fresh node must pick up from 7.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut rescuer = Node::new(&handle);
    let (resp, env) = rescuer.sync(None).await;
    assert_eq!(resp.message, SyncResponse::NEW_TASK);
    assert_eq!(env.task_id, Some(task_id));
    assert_eq!(value(&env), 7);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn task_ids_are_distinct_even_after_cancel_and_requeue() {
    let server = Server::new(config(Duration::from_millis(100)), registry());
    let (handle, _feeds) = server.serve().await.unwrap();

    let (a, b) = tokio::join!(
        server.submit(counter(0, 5), false),
        server.submit(counter(0, 5), false)
    );
    assert_ne!(a.id, b.id);

    let mut node = Node::new(&handle);
    let (_, first) = node.sync(None).await;
    a.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let c = server.submit(counter(0, 5), false).await;
    let ids: HashSet<TaskId> = [a.id, b.id, c.id].into_iter().collect();
    assert_eq!(ids.len(), 3);
    assert!(first.task_id.is_some());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn version_mismatch_never_gets_a_task() {
    let server = Server::new(config(Duration::from_secs(5)), registry());
    let (handle, _feeds) = server.serve().await.unwrap();
    let _sub = server.submit(counter(0, 3), false).await;

    let mut node = Node::new(&handle);
    node.version = weft_core::PROTOCOL_VERSION + 1;
    for _ in 0..3 {
        let (resp, env) = node.sync(None).await;
        assert_eq!(resp.message, SyncResponse::MUST_UPGRADE);
        assert!(env.is_empty());
    }

    // Same story for a node with history.
    let mut veteran = Node::new(&handle);
    veteran.sync(None).await;
    veteran.version += 1;
    let (resp, env) = veteran.sync(Some(TaskEnvelope::empty())).await;
    assert_eq!(resp.message, SyncResponse::MUST_UPGRADE);
    assert!(env.is_empty());

    let status = server.status().await;
    assert_eq!(status.live_nodes, 1, "only the matching node registered");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_node_is_removed_and_task_reappears_once() {
    let server = Server::new(config(Duration::from_millis(120)), registry());
    let (handle, _feeds) = server.serve().await.unwrap();
    let mut events = server.subscribe_nodes();
    let sub = server.submit(counter(0, 10), false).await;

    let mut node = Node::new(&handle);
    let (_, env) = node.sync(None).await;
    let lost_node = node.node_id.unwrap();
    assert_eq!(env.task_id, Some(sub.id));

    let lost = loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let NodeEvent::Lost { .. } = event {
            break event;
        }
    };
    assert_eq!(lost.node_id(), lost_node);
    assert_eq!(server.status().await.live_nodes, 0);
    assert_eq!(server.status().await.pending_tasks, 1);

    let mut a = Node::new(&handle);
    let mut b = Node::new(&handle);
    let (_, got_a) = a.sync(None).await;
    let (_, got_b) = b.sync(None).await;
    let assigned: Vec<_> = [got_a.task_id, got_b.task_id].into_iter().flatten().collect();
    assert_eq!(assigned, vec![sub.id]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_before_dequeue_is_never_assigned() {
    let server = Server::new(config(Duration::from_secs(5)), registry());
    let (handle, _feeds) = server.serve().await.unwrap();

    let sub = server.submit(counter(0, 3), false).await;
    sub.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut node = Node::new(&handle);
    let (resp, env) = node.sync(None).await;
    assert_eq!(resp.message, SyncResponse::NO_WORK);
    assert!(env.is_empty());
    assert_eq!(server.status().await.pending_tasks, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn restarted_server_routes_report_to_recovery_feed() {
    let server = Server::new(config(Duration::from_secs(5)), registry());
    let (handle, mut feeds) = server.serve().await.unwrap();

    let mut node = Node::new(&handle);
    node.node_id = Some(NodeId(3));
    node.server_id = Some(ServerId(server.server_id().0.wrapping_add(1)));
    let (resp, _) = node
        .sync(Some(TaskEnvelope::new(TaskId(11), Arc::new(counter(4, 9)))))
        .await;
    assert_eq!(resp.server_id, Some(server.server_id()));
    assert_ne!(resp.node_id, Some(NodeId(3)));

    let recovered = tokio::time::timeout(Duration::from_secs(1), feeds.recovered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.previous_task_id, Some(TaskId(11)));
    assert_eq!(recovered.task.downcast_ref::<Counter>().unwrap().value, 4);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn download_serves_an_executable() {
    let server = Server::new(config(Duration::from_secs(5)), registry());
    let (handle, _feeds) = server.serve().await.unwrap();

    let resp = reqwest::get(format!("{}/download", handle.url())).await.unwrap();
    assert!(resp.status().is_success());
    assert!(!resp.bytes().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}
