//! xregion-daemon - scheduler for the cross-region transaction coordinator.
//!
//! The binary loads configuration, opens the shared store and drives the
//! three coordinator phases on independent intervals until it receives
//! SIGINT or SIGTERM.
//!
//! # Modules
//!
//! - [`scheduler`]: per-phase interval loops and single-shot (cron) mode
//! - [`state`]: shutdown flag shared by the loops
//! - [`status`]: operator view of stored transactions
//! - [`wiring`]: builds a coordinator from configuration

pub mod scheduler;
pub mod state;
pub mod status;
pub mod wiring;

pub use scheduler::{OnceReport, Phase, run_once, spawn_phase_loops};
pub use state::{SchedulerState, SharedState};
