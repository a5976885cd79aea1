// Callback context — every user-facing callback runs on one task, in order.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub(crate) struct CallbackDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl CallbackDispatcher {
    pub(crate) fn spawn(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("request callback panicked");
                }
            }
        });
        Self { tx }
    }

    pub(crate) fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Receiver gone means the runtime is shutting down; run in place.
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Box::new(job)) {
            job();
        }
    }
}
