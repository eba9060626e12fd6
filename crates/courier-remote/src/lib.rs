//! HTTP client for the remote document service.
//!
//! Implements [`courier_transfer::DocumentService`] on top of `reqwest`, with
//! streamed runs read through `reqwest-eventsource`, and provides the buffered
//! secondary upload strategy.

mod buffered;
mod client;
mod events;
mod wire;

pub use buffered::BufferedUpload;
pub use client::{FileBody, HttpDocumentService, RemoteConfig};
