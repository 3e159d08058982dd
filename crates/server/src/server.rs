//! Server lifecycle: wiring, task submission and the HTTP listener.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use weft_core::config::ServerConfig;
use weft_core::{NodeId, ServerId, Task, TaskRef, TaskRegistry};

use crate::coordinator::{Coordinator, StatusReport};
use crate::error::ServerError;
use crate::events::{NodeEvent, RecoveredTask};
use crate::nodes::NodeRegistry;
use crate::router::build_router;
use crate::tracker::{Submission, TaskTracker};

pub struct Server {
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
    /// Taken by the one call to [`Server::serve`].
    recovered: Mutex<Option<mpsc::Receiver<RecoveredTask>>>,
}

/// Observer feeds handed out when the server starts.
pub struct Feeds {
    pub nodes: broadcast::Receiver<NodeEvent>,
    pub recovered: mpsc::Receiver<RecoveredTask>,
}

/// Running listener. Dropping the handle shuts the listener down.
pub struct ServeHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Server {
    /// Build a server. The registry must already hold every task kind that
    /// will cross the wire.
    pub fn new(config: ServerConfig, registry: TaskRegistry) -> Self {
        let server_id = ServerId(config.server_id.unwrap_or_else(rand::random));
        let tracker = Arc::new(TaskTracker::new());
        let nodes = Arc::new(NodeRegistry::new(
            config.node_timeout,
            Arc::clone(&tracker),
            config.feed_capacity,
        ));
        let (recovered_tx, recovered_rx) = mpsc::channel(config.feed_capacity.max(1));
        let coordinator = Arc::new(Coordinator::new(
            config.version,
            server_id,
            Arc::new(registry),
            nodes,
            tracker,
            recovered_tx,
        ));

        Self {
            config,
            coordinator,
            recovered: Mutex::new(Some(recovered_rx)),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.coordinator.server_id()
    }

    pub fn version(&self) -> u32 {
        self.coordinator.version()
    }

    pub async fn submit<T: Task>(&self, task: T, block: bool) -> Submission {
        self.submit_ref(Arc::new(task), block).await
    }

    pub async fn submit_ref(&self, task: TaskRef, block: bool) -> Submission {
        self.coordinator.tracker().submit(task, block).await
    }

    /// Drop a node now, requeueing whatever it held.
    pub async fn evict_node(&self, node_id: NodeId) -> bool {
        self.coordinator.nodes().evict(node_id).await
    }

    pub fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.coordinator.nodes().subscribe()
    }

    pub async fn status(&self) -> StatusReport {
        self.coordinator.status().await
    }

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.coordinator))
    }

    /// Bind the configured address and serve in the background.
    ///
    /// # Panics
    ///
    /// If called more than once on the same server.
    pub async fn serve(&self) -> Result<(ServeHandle, Feeds), ServerError> {
        let recovered = self
            .recovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(recovered) = recovered else {
            panic!("Server::serve called twice");
        };

        let addr = self.config.listen.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let nodes = self.subscribe_nodes();
        let app = self.router();

        info!(
            %local_addr,
            server_id = %self.server_id(),
            version = self.version(),
            node_timeout = ?self.config.node_timeout,
            "sync server listening"
        );

        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await?;
            info!(%local_addr, "sync server stopped");
            Ok::<(), ServerError>(())
        });

        Ok((
            ServeHandle {
                local_addr,
                shutdown,
                task,
            },
            Feeds { nodes, recovered },
        ))
    }
}

impl ServeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        let _ = self.shutdown.send(true);
        self.task.await?
    }

    /// Wait for the listener to stop on its own.
    pub async fn wait(self) -> Result<(), ServerError> {
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".into(),
            server_id: Some(42),
            node_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn fixed_server_id_from_config() {
        let server = Server::new(config(), TaskRegistry::new());
        assert_eq!(server.server_id(), ServerId(42));
    }

    #[test]
    fn random_server_ids_differ() {
        let cfg = ServerConfig {
            server_id: None,
            ..config()
        };
        let a = Server::new(cfg.clone(), TaskRegistry::new());
        let b = Server::new(cfg, TaskRegistry::new());
        assert_ne!(a.server_id(), b.server_id());
    }

    #[tokio::test]
    async fn serve_binds_and_shuts_down() {
        let server = Server::new(config(), TaskRegistry::new());
        let (handle, _feeds) = server.serve().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "serve called twice")]
    async fn serving_twice_panics() {
        let server = Server::new(config(), TaskRegistry::new());
        let _first = server.serve().await.unwrap();
        let _ = server.serve().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let cfg = ServerConfig {
            listen: "not-an-address".into(),
            ..config()
        };
        let server = Server::new(cfg, TaskRegistry::new());
        assert!(matches!(server.serve().await, Err(ServerError::Bind { .. })));
    }
}
