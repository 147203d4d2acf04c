//! Channel front end for transports.
//!
//! A transport sends [`Submission`]s into an mpsc channel; one receiving
//! loop spawns each operation as its own task, so a slow backend call only
//! holds up the request that made it. Replies go back over a oneshot.
//!
//! If the requester has gone away by the time its operation finishes, any
//! handle reference the reply carried is released. Nothing on the backend
//! is undone.

use std::sync::Arc;

use bucketfs_core::FsError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::engine::Engine;
use crate::request::{Operation, Reply};

/// One queued request.
#[derive(Debug)]
pub struct Submission {
    pub op: Operation,
    pub reply: oneshot::Sender<Reply>,
}

/// Cheap, cloneable sender side of a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    tx: mpsc::Sender<Submission>,
}

impl DispatchClient {
    /// Queues `op` without waiting for it; the reply arrives on the receiver.
    pub async fn submit(&self, op: Operation) -> Result<oneshot::Receiver<Reply>, FsError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Submission { op, reply })
            .await
            .map_err(|_| closed())?;
        Ok(rx)
    }

    /// Runs `op` and waits for its reply.
    pub async fn call(&self, op: Operation) -> Reply {
        let rx = self.submit(op).await?;
        rx.await.map_err(|_| closed())?
    }

    /// Blocking variant of [`call`](Self::call) for synchronous transports.
    ///
    /// Must not be called from inside the runtime's async context.
    pub fn call_blocking(&self, op: Operation) -> Reply {
        let (reply, rx) = oneshot::channel();
        self.tx
            .blocking_send(Submission { op, reply })
            .map_err(|_| closed())?;
        rx.blocking_recv().map_err(|_| closed())?
    }
}

fn closed() -> FsError {
    FsError::BackendFatal {
        op: "dispatch",
        key: String::new(),
        message: "dispatcher is not running".into(),
    }
}

/// Starts the receiving loop.
///
/// The loop ends once every [`DispatchClient`] is dropped; operations
/// already spawned run to completion.
pub fn spawn_dispatcher(engine: Arc<Engine>, capacity: usize) -> (DispatchClient, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Submission>(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(Submission { op, reply }) = rx.recv().await {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if reply.is_closed() {
                    trace!(op = op.name(), "Request abandoned before it started");
                    return;
                }
                let name = op.name();
                let result = engine.execute(op).await;
                if let Err(Ok(response)) = reply.send(result)
                    && let Some((handle, refs)) = response.retained_handle()
                {
                    debug!(op = name, handle = %handle, refs, "Requester gone; releasing handle");
                    if let Err(e) = engine.handles().release(handle, refs) {
                        warn!(handle = %handle, error = %e, "Could not release abandoned handle");
                    }
                }
            });
        }
        debug!("Dispatcher stopped");
    });
    (DispatchClient { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handle_table::OpenMode;
    use crate::request::Response;
    use bucketfs_core::testing::{Capability, InstrumentedBackend};
    use bucketfs_core::{BackendExecutor, RetryPolicy};
    use std::time::Duration;

    fn engine() -> (Arc<InstrumentedBackend>, Arc<Engine>) {
        let (_store, backend) = InstrumentedBackend::memory();
        let exec = BackendExecutor::object_store(backend.clone(), "", RetryPolicy::none());
        (backend, Arc::new(Engine::new(exec, EngineConfig::default()).unwrap()))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (_backend, engine) = engine();
        let (client, _task) = spawn_dispatcher(Arc::clone(&engine), 8);
        let reply = client
            .call(Operation::Mkdir {
                parent: engine.root(),
                name: "d".into(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, Response::Entry(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_create_releases_handle() {
        let (backend, engine) = engine();
        let (client, _task) = spawn_dispatcher(Arc::clone(&engine), 8);
        backend.set_delay(Capability::Put, Some(Duration::from_secs(1)));

        let rx = client
            .submit(Operation::Create {
                parent: engine.root(),
                name: "f".into(),
                mode: OpenMode::READ_WRITE,
                exclusive: true,
            })
            .await
            .unwrap();
        // Let the operation start and park on the slow put, then walk away.
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rx);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(backend.calls(Capability::Put), 1);
        assert_eq!(engine.handles().len(), 1, "only the root handle should remain");
    }

    #[tokio::test]
    async fn test_closed_dispatcher_reports_error() {
        let (_backend, engine) = engine();
        let (client, task) = spawn_dispatcher(engine, 1);
        task.abort();
        let _ = task.await;
        let err = client.call(Operation::Init).await.unwrap_err();
        assert!(matches!(err, FsError::BackendFatal { op: "dispatch", .. }));
    }

    #[test]
    fn test_call_blocking_from_plain_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (_backend, engine) = engine();
        let root = engine.root();
        let (client, _task) = runtime.block_on(async { spawn_dispatcher(engine, 4) });

        let reply = std::thread::spawn(move || client.call_blocking(Operation::GetAttr { handle: root }))
            .join()
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Response::Attr(_)));
    }
}
