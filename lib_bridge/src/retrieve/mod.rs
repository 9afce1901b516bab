//! # Data Retrieval Module
//!
//! HTTP plumbing shared by the REST ingestors: base-URL joining, the Kismet API key header,
//! per-request timeouts and transient-error retries. Ingestors only deal with paths and JSON.
//!
//! - **`ky_http`**: `ApiClient` on `reqwest` + `reqwest-middleware` with exponential backoff.

pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse};
