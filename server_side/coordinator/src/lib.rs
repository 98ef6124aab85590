//! Coordinates a set of axis controllers on a shared serial bus: scripts are
//! expanded into a durable queue and executed one motion unit at a time.
pub mod config;
pub mod engine;
pub mod policy;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod script;
pub mod signals;
pub mod util;

pub use config::Config;
pub use engine::{Engine, Intake, SystemState};
