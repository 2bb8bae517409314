//! Remote execution boundary for autocycle.
//!
//! [`RemoteBackend`] is the raw interface to a study service operated by
//! human participants. [`RemoteJobClient`] sits in front of it: it retries
//! transient failures with bounded backoff, enforces the dispatch → poll →
//! fetch ordering, and runs the cancellable poll loop.

pub mod backend;
pub mod client;
pub mod http;
pub mod retry;
pub mod sandbox;
pub mod simulator;

pub use backend::{BackendResult, RemoteBackend};
pub use client::{Deadline, RemoteJobClient};
pub use http::HttpBackend;
pub use retry::RetryPolicy;
pub use sandbox::{SandboxBackend, Session};
pub use simulator::ParticipantSimulator;
pub use tokio_util::sync::CancellationToken;
