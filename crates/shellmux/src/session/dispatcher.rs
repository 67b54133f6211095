//! The dispatcher worker.
//!
//! One task per multiplexer waits on the readiness of every registered
//! session at once and lets each ready session read one chunk. The registry is
//! re-snapshotted whenever it changes, so sessions added or removed while
//! the worker is waiting are picked up promptly.

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{select_all, BoxFuture};
use futures_util::FutureExt;
use tokio::time::{sleep, timeout};

use super::multiplexer::MuxInner;
use super::registry::{ReadinessHandle, ReadinessToken};

/// Clears `worker_running` if the worker unwinds without reaching its
/// normal exit, so the next `add_session` can start a replacement.
struct WorkerGuard {
    inner: Arc<MuxInner>,
    epoch: u64,
    armed: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock();
        if state.starts == self.epoch && state.worker_running {
            state.worker_running = false;
            tracing::error!(epoch = self.epoch, "Dispatcher exited abnormally");
        }
        drop(state);
        self.inner.worker_exit.notify_waiters();
    }
}

fn readiness(handle: &ReadinessHandle) -> BoxFuture<'static, (ReadinessToken, io::Result<()>)> {
    let handle = handle.clone();
    async move {
        let result = handle.ready().await;
        (handle.token(), result)
    }
    .boxed()
}

/// Runs until the multiplexer's flag is cleared.
///
/// `epoch` identifies this worker among all workers the multiplexer has
/// started.
pub(crate) async fn run(inner: Arc<MuxInner>, epoch: u64) {
    let mut guard = WorkerGuard {
        inner: Arc::clone(&inner),
        epoch,
        armed: true,
    };

    let mut buf = vec![0u8; inner.config.read_chunk_size.max(1)];
    let mut offset = 0usize;

    tracing::debug!(epoch, "Dispatcher running");

    loop {
        let mut handles = {
            let mut state = inner.lock();
            if !state.should_continue {
                state.worker_running = false;
                guard.armed = false;
                break;
            }
            state.registry.snapshot_readiness_handles()
        };

        if handles.is_empty() {
            let _ = timeout(inner.config.idle_poll(), inner.changed.notified()).await;
            continue;
        }

        let start = offset % handles.len();
        handles.rotate_left(start);
        offset = offset.wrapping_add(1);

        let waits: Vec<_> = handles.iter().map(readiness).collect();

        let (first, rest) = tokio::select! {
            _ = inner.changed.notified() => continue,
            ((token, result), _, rest) = select_all(waits) => ((token, result), rest),
        };

        let mut ready: HashMap<ReadinessToken, io::Result<()>> = HashMap::new();
        ready.insert(first.0, first.1);
        for wait in rest {
            if let Some((token, result)) = wait.now_or_never() {
                ready.insert(token, result);
            }
        }

        let mut served = 0usize;
        for handle in &handles {
            let Some(result) = ready.remove(&handle.token()) else {
                continue;
            };

            if let Err(e) = result {
                tracing::warn!(token = %handle.token(), error = %e, "Readiness wait failed");
                continue;
            }

            let session = inner.lock().registry.lookup(handle.token());
            match session {
                Some(session) => {
                    if AssertUnwindSafe(session.read(&mut buf))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        tracing::error!(
                            session_id = %session.id(),
                            "Session read panicked, closing it"
                        );
                        session.close().await;
                    }
                    served += 1;
                }
                None => {
                    tracing::trace!(token = %handle.token(), "Ready handle no longer registered");
                }
            }
        }

        if served == 0 {
            sleep(inner.config.select_backoff()).await;
        }
    }

    inner.worker_exit.notify_waiters();
    tracing::info!(epoch, "Dispatcher stopped");
}
