// Engine orchestration — request lifecycle, result pipeline and response cache.

pub mod cache;
pub(crate) mod dispatch;
pub mod handle;
pub mod hooks;
pub mod pipeline;
pub mod session;
pub mod stats;

pub use cache::{CacheKey, CacheStore};
pub use handle::{Callbacks, RequestHandle, RequestId, RequestState};
pub use hooks::{FilterDecision, PreOperation, SessionHooks};
pub use pipeline::{Delivery, Outcome, ResponseValue};
pub use session::{SessionEngine, SessionEngineBuilder};
pub use stats::StatsSnapshot;
