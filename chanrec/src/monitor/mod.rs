//! Live status monitoring.
//!
//! [`MonitorScheduler`] runs one poll iteration per interval: it lists the
//! registry, checks every channel through a [`LiveStatusPoller`] and feeds the
//! results to the recording supervisor.

pub mod auth;
pub mod poller;
pub mod scheduler;

pub use auth::AppToken;
pub use poller::{HelixPoller, LiveStatusPoller};
pub use scheduler::{MonitorScheduler, TickReport};
