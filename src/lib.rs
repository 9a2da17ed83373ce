//! Remote, content-addressable cache for build task outputs
//!
//! The client side ([`client`]) packs task outputs into gzip-compressed tar
//! streams and uploads them in the background; it retrieves them again
//! by hash. The server side ([`server`]) streams uploads into an
//! [`store::ObjectStore`] and keeps an [`index::ArtifactIndex`] with a
//! download counter per artifact.

pub mod archive;
pub mod client;
pub mod config;
pub mod index;
pub mod protocol;
pub mod server;
pub mod store;
pub mod types;
