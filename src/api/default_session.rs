// Optional process-wide default session for call sites without an engine reference.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Method;
use tracing::info;

use crate::engine::{Callbacks, Outcome, RequestHandle, SessionEngine};
use crate::request::{Params, RequestDescriptor};

static DEFAULT: RwLock<Option<SessionEngine>> = parking_lot::const_rwlock(None);

/// Install `engine` as the default. The replaced engine has all its
/// outstanding requests cancelled and is returned.
pub fn set_default(engine: SessionEngine) -> Option<SessionEngine> {
    let previous = DEFAULT.write().replace(engine);
    if let Some(old) = &previous {
        let cancelled = old.cancel_all();
        info!("default session replaced ({} requests cancelled)", cancelled);
    }
    previous
}

pub fn default_session() -> Option<SessionEngine> {
    DEFAULT.read().clone()
}

/// Tear down the default session, cancelling its outstanding requests.
pub fn clear_default() -> Option<SessionEngine> {
    let previous = DEFAULT.write().take();
    if let Some(old) = &previous {
        old.cancel_all();
    }
    previous
}

/// Build, register and dispatch a request on the default session.
/// Returns `None` when no default session is installed.
pub fn send<F>(method: Method, path: &str, params: Params, on_complete: F) -> Option<Arc<RequestHandle>>
where
    F: Fn(&Outcome) + Send + Sync + 'static,
{
    let engine = default_session()?;
    let descriptor = RequestDescriptor::builder(method, path).params(params).build();
    let handle = RequestHandle::with_callbacks(descriptor, Callbacks::new().on_complete(on_complete));
    engine.append(&handle);
    Some(handle)
}
