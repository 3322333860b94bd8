//! Watches live channels and records their stream and chat while they are live.
//!
//! The [`supervisor::RecordingSupervisor`] owns every recording session;
//! [`monitor::MonitorScheduler`] feeds it live/offline observations and
//! [`service::ChannelService`] is the boundary for channel management.

pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod recorder;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod utils;

pub use error::{Error, Result};
