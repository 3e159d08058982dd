//! HTTP router construction.
//!
//! - `POST /sync`: one protocol exchange, binary body in and out
//! - `GET /status`: JSON snapshot of nodes and tasks
//! - `GET /download`: the running server executable, for node bootstrap

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;

use crate::coordinator::{Coordinator, StatusReport};
use crate::error::SyncError;

const OCTET_STREAM: &str = "application/octet-stream";

pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/sync", any(sync))
        .route("/status", get(status))
        .route_service("/download", ServeFile::new(executable_path()))
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

async fn sync(
    State(coordinator): State<Arc<Coordinator>>,
    method: Method,
    body: Bytes,
) -> Result<Response, SyncError> {
    if method != Method::POST {
        return Err(SyncError::BadMethod);
    }
    let out = coordinator.handle_sync(&body).await?;
    Ok(([(header::CONTENT_TYPE, OCTET_STREAM)], out).into_response())
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<StatusReport> {
    Json(coordinator.status().await)
}

fn executable_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .or_else(|| std::env::args_os().next().map(PathBuf::from))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use weft_core::{
        NodeCapabilities, RecordReader, RecordWriter, ServerId, SyncRequest, SyncResponse,
        TaskRegistry,
    };

    use super::*;
    use crate::nodes::NodeRegistry;
    use crate::tracker::TaskTracker;

    fn app() -> Router {
        let tracker = Arc::new(TaskTracker::new());
        let nodes = Arc::new(NodeRegistry::new(Duration::from_secs(5), Arc::clone(&tracker), 8));
        let (tx, _rx) = mpsc::channel(1);
        build_router(Arc::new(Coordinator::new(
            1,
            ServerId(0xfeed),
            Arc::new(TaskRegistry::new()),
            nodes,
            tracker,
            tx,
        )))
    }

    fn first_contact() -> Vec<u8> {
        let mut writer = RecordWriter::new();
        writer
            .write(&SyncRequest {
                version: 1,
                server_id: None,
                capabilities: NodeCapabilities::default(),
            })
            .unwrap();
        writer.finish()
    }

    #[tokio::test]
    async fn sync_accepts_post() {
        let response = app()
            .oneshot(
                Request::post("/sync")
                    .body(Body::from(first_contact()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], OCTET_STREAM);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let mut reader = RecordReader::new(&body);
        let decoded: SyncResponse = reader.read().unwrap();
        assert_eq!(decoded.message, SyncResponse::NO_WORK);
        assert_eq!(decoded.server_id, Some(ServerId(0xfeed)));
    }

    #[tokio::test]
    async fn sync_rejects_other_methods() {
        let response = app()
            .oneshot(Request::get("/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("POST"));
    }

    #[tokio::test]
    async fn sync_rejects_garbage() {
        let response = app()
            .oneshot(Request::post("/sync").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let app = app();
        let synced = app
            .clone()
            .oneshot(Request::post("/sync").body(Body::from(first_contact())).unwrap())
            .await
            .unwrap();
        assert_eq!(synced.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: StatusReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.version, 1);
        assert_eq!(status.server_id, ServerId(0xfeed).to_string());
        assert_eq!(status.live_nodes, 1);
        assert_eq!(status.pending_tasks, 0);
        assert_eq!(status.in_flight_tasks, 0);
        assert_eq!(status.nodes.len(), 1);
        assert_eq!(status.nodes[0].capabilities.cpus, 1);
    }
}
