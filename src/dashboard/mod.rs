//! Live dashboard: polls the aggregate views with backoff and renders only
//! what changed.

pub mod backoff;
pub mod kde;
mod poller;
pub mod render;
pub mod snapshot;

pub use backoff::PollBackoff;
pub use kde::{compute_kde, KdeCurve};
pub use poller::{CycleReport, DashboardPoller, PollerHandle};
pub use render::{DashboardPresenter, DashboardRenderer, MapFocus};
pub use snapshot::DashboardSnapshot;
