//! Shared test scaffolding: boot a real Control API server on an
//! ephemeral loopback port backed by a throwaway SQLite file, the same
//! way `ffarm-master` wires `AppState` together, so integration tests
//! exercise the actual HTTP surface instead of calling handlers directly.

use ffarm::api::{self, AppState};
use ffarm::pause::PauseState;
use ffarm::store::Store;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[allow(dead_code)]
pub struct TestServer {
    pub base_url: String,
    pub store: Arc<Store>,
    _dir: tempfile::TempDir,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start(lease_duration_secs: i64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("ffarm.sqlite3");

        let store = Arc::new(Store::open(&db_path).expect("open store"));
        let state = Arc::new(AppState { store: store.clone(), pause: PauseState::new(), lease_duration_secs });
        let app = api::build_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local_addr");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .expect("test server error");
        });

        Self { base_url: format!("http://{addr}"), store, _dir: dir, shutdown_tx, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}
