//! Snapshot HTTP server
//!
//! Serves the latest `QueueSnapshot` as JSON on `GET /metrics`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::{QueueSnapshot, SnapshotReceiver};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Metrics server failed: {0}")]
    Serve(std::io::Error),
}

/// Handler for GET /metrics endpoint
async fn get_metrics(State(snapshots): State<SnapshotReceiver>) -> Json<QueueSnapshot> {
    let snapshot = snapshots.borrow().clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(snapshots: SnapshotReceiver) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(snapshots)
}

/// Runs the metrics HTTP server on `addr` until it fails
pub async fn run_metrics_server(
    addr: SocketAddr,
    snapshots: SnapshotReceiver,
) -> Result<(), ServerError> {
    let app = create_metrics_router(snapshots);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "serving queue snapshots on /metrics");

    axum::serve(listener, app).await.map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobId, JobOptions};
    use crate::metrics::snapshot_channel;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use tower::ServiceExt;

    async fn fetch(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_get_metrics_returns_latest_snapshot() {
        let (tx, rx) = snapshot_channel();
        let app = create_metrics_router(rx);

        let job = Job::new(JobId(3), PathBuf::from("/media/video.mkv"), JobOptions::default());
        tx.send_replace(QueueSnapshot::from_jobs([&job], 2, 1701388800000));

        let (status, body) = fetch(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);

        let snapshot: QueueSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to QueueSnapshot");
        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert_eq!(snapshot.max_concurrency, 2);
        assert_eq!(snapshot.queue_len, 1);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].id, 3);
        assert_eq!(snapshot.jobs[0].input_path, "/media/video.mkv");
    }

    #[tokio::test]
    async fn test_get_metrics_empty_snapshot() {
        let (_tx, rx) = snapshot_channel();
        let app = create_metrics_router(rx);

        let (status, body) = fetch(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: QueueSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot, QueueSnapshot::default());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_tx, rx) = snapshot_channel();
        let (status, _) = fetch(create_metrics_router(rx), "/jobs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
