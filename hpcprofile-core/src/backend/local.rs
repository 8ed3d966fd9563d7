//! Local in-process cluster backend.
//!
//! The "cluster" is a worker pool tracked inside the current process, with
//! a TCP control socket standing in for the scheduler endpoint so that
//! remote shutdown works the same way it does for real deployments. Actual
//! worker processes are out of scope; the pool tracks counts and lifecycle
//! only.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn};

use super::{ClusterBackend, ClusterHandle, ClusterSpec};
use crate::error::{ProfileError, Result};

const RECOGNIZED_PARAMS: [&str; 4] = ["processes", "memory", "local_directory", "threads_per_worker"];

/// Backend spawning in-process worker pools
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterBackend for LocalBackend {
    fn type_name(&self) -> &str {
        "local"
    }

    async fn spawn(&self, spec: ClusterSpec) -> Result<Box<dyn ClusterHandle>> {
        for key in spec.params.keys() {
            if !RECOGNIZED_PARAMS.contains(&key.as_str()) {
                warn!("local backend ignores parameter {key:?}");
            }
        }

        debug!(
            "spawning local pool for {:?} (asynchronous: {})",
            spec.name, spec.asynchronous
        );
        let initial_workers = spec.usize_param("processes").unwrap_or(0);
        let state = Arc::new(PoolState {
            workers: Mutex::new(initial_workers),
            worker_notify: Notify::new(),
            shutdown: watch::channel(false).0,
        });

        // The control socket binds inside the task so it registers with
        // whichever runtime the caller handed us.
        let (addr_tx, addr_rx) = oneshot::channel();
        let control = control_loop(Arc::clone(&state), addr_tx);
        match &spec.runtime {
            Some(handle) => {
                handle.spawn(control);
            }
            None => {
                tokio::spawn(control);
            }
        }

        let addr = addr_rx
            .await
            .map_err(|_| ProfileError::Backend("scheduler control task died".to_string()))??;
        let address = format!("tcp://{addr}");
        info!(
            "local cluster {:?} up at {} with {} workers",
            spec.name, address, initial_workers
        );

        Ok(Box::new(LocalCluster { address, state }))
    }
}

struct PoolState {
    workers: Mutex<usize>,
    worker_notify: Notify,
    shutdown: watch::Sender<bool>,
}

impl PoolState {
    fn trigger_shutdown(&self) {
        // send_replace: the value must flip even before anyone subscribed
        self.shutdown.send_replace(true);
        self.worker_notify.notify_waiters();
    }
}

async fn control_loop(state: Arc<PoolState>, addr_tx: oneshot::Sender<Result<std::net::SocketAddr>>) {
    let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = addr_tx.send(Err(e.into()));
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = addr_tx.send(Err(e.into()));
            return;
        }
    };
    let _ = addr_tx.send(Ok(addr));

    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("control connection from {peer}");
                        handle_control_connection(stream, &state).await;
                    }
                    Err(e) => {
                        warn!("control accept failed: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("control loop stopping");
                    break;
                }
            }
        }
    }
}

async fn handle_control_connection(stream: TcpStream, state: &PoolState) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "shutdown" => {
                let _ = write.write_all(b"ok\n").await;
                state.trigger_shutdown();
                return;
            }
            "workers" => {
                let count = *state.workers.lock().expect("pool lock poisoned");
                let _ = write.write_all(format!("{count}\n").as_bytes()).await;
            }
            other => {
                debug!("unknown control command {other:?}");
                let _ = write.write_all(b"error: unknown command\n").await;
            }
        }
    }
}

/// Handle to a running local worker pool
pub struct LocalCluster {
    address: String,
    state: Arc<PoolState>,
}

#[async_trait]
impl ClusterHandle for LocalCluster {
    fn scheduler_address(&self) -> &str {
        &self.address
    }

    fn workers(&self) -> usize {
        *self.state.workers.lock().expect("pool lock poisoned")
    }

    async fn scale(&self, n: usize) -> Result<()> {
        debug!("scaling local pool to {n} workers");
        *self.state.workers.lock().expect("pool lock poisoned") = n;
        self.state.worker_notify.notify_waiters();
        Ok(())
    }

    async fn wait_for_workers(&self, n: usize) -> Result<()> {
        loop {
            let notified = self.state.worker_notify.notified();
            if self.workers() >= n {
                return Ok(());
            }
            if *self.state.shutdown.subscribe().borrow() {
                return Err(ProfileError::Backend(
                    "cluster shut down while waiting for workers".to_string(),
                ));
            }
            notified.await;
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.trigger_shutdown();
        Ok(())
    }

    async fn finished(&self) {
        let mut shutdown = self.state.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn spec(params: Value) -> ClusterSpec {
        ClusterSpec {
            name: "test".to_string(),
            params: params.as_object().cloned().unwrap_or_else(Map::new),
            asynchronous: true,
            runtime: None,
        }
    }

    #[tokio::test]
    async fn spawn_reports_a_tcp_address() {
        let cluster = LocalBackend::new().spawn(spec(json!({}))).await.unwrap();
        assert!(cluster.scheduler_address().starts_with("tcp://127.0.0.1:"));
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn processes_sets_the_initial_pool_size() {
        let cluster = LocalBackend::new()
            .spawn(spec(json!({"processes": 4})))
            .await
            .unwrap();
        assert_eq!(cluster.workers(), 4);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scale_then_wait_for_workers() {
        let cluster = LocalBackend::new().spawn(spec(json!({}))).await.unwrap();

        cluster.scale(2).await.unwrap();
        cluster.wait_for_workers(2).await.unwrap();
        assert_eq!(cluster.workers(), 2);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn finished_resolves_after_shutdown() {
        let cluster = LocalBackend::new().spawn(spec(json!({}))).await.unwrap();

        cluster.shutdown().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), cluster.finished())
            .await
            .expect("finished() should resolve promptly after shutdown");
    }

    #[tokio::test]
    async fn remote_shutdown_over_the_control_socket() {
        let cluster = LocalBackend::new().spawn(spec(json!({}))).await.unwrap();

        let address = cluster.scheduler_address().to_string();
        crate::client::shutdown_cluster(&address).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), cluster.finished())
            .await
            .expect("remote shutdown should finish the cluster");
    }
}
