//! Guarded background tasks.
//!
//! Background activities (relay forwarder, chunk reassembler, reconnect
//! watcher) are spawned through [`spawn_guarded`] so a panicking task can
//! never turn into a silent hang: the panic is logged and the process
//! aborts. Ordinary completion and cancellation pass through untouched.

use std::future::Future;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawn `future` on the runtime, aborting the process if it panics.
pub fn spawn_guarded<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if std::panic::AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .is_err()
        {
            error!(task = name, "background task panicked; aborting process");
            std::process::abort();
        }
    })
}
