//! Request orchestration over a pluggable HTTP transport.
//!
//! A [`SessionEngine`] owns the registry of outstanding requests, consults an
//! expiring on-disk [`CacheStore`] for cacheable GETs, and routes every
//! transport outcome through the result pipeline so each dispatch attempt
//! ends in exactly one terminal callback.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod request;
pub mod transport;

pub use config::SessionConfig;
pub use engine::{
    CacheKey, CacheStore, Callbacks, FilterDecision, Outcome, PreOperation, RequestHandle,
    RequestId, RequestState, ResponseValue, SessionEngine, SessionHooks, StatsSnapshot,
};
pub use error::{RequestError, TransportError};
pub use request::{
    CachePolicy, MultipartPart, ParameterEncoding, RequestBuilder, RequestDescriptor,
    ResultEncoding, ResultFormat,
};
