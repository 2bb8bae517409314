//! Closed-loop experimentation engine.
//!
//! [`CycleController`] runs sample → synthesize → dispatch → poll →
//! aggregate → fit for a fixed number of cycles. It is the only writer of
//! [`CycleState`]; observers read immutable [`CycleSnapshot`]s through a
//! [`SnapshotHandle`].

pub mod controller;
pub mod model;
pub mod snapshot;
pub mod state;

pub use controller::{CycleController, RunError, RunSummary};
pub use model::{LinearFit, LinearRegression, MeanFit, MeanModel, ModelFitter};
pub use snapshot::{CycleSnapshot, SnapshotHandle, SnapshotPublisher};
pub use state::{CyclePhase, CycleState};
