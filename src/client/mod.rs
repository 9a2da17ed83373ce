//! Client side of the remote cache
//!
//! [`HttpRemoteCache`] implements the orchestrator-facing [`RemoteCache`]
//! contract on top of [`CacheTransport`] and the archive codec.

pub mod adapter;
pub mod errors;
pub mod transport;
pub mod uploads;

pub use adapter::{HttpRemoteCache, RemoteCache};
pub use errors::ClientError;
pub use transport::CacheTransport;
pub use uploads::{DrainSummary, InFlightUploads};
