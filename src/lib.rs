//! Booking conflict and availability engine for multi-tenant appointment
//! scheduling.

pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, ErrorKind};
