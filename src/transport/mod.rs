// Transport abstraction — the wire-level HTTP capability the engine drives.

pub mod http_transport;
pub mod traits;

pub use http_transport::{HttpTransport, HttpTransportFactory};
pub use traits::{
    RawResponse, Transport, TransportBody, TransportCall, TransportFactory, TransportSettings,
};
