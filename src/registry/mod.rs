//! Runner registry: live capacity and health facts about each runner.

mod roster;
mod runner;

pub use roster::{Candidate, Demand, ModelEligibility, RegistryConfig, ReserveError, RunnerRegistry};
pub use runner::{ResidentModel, Runner, RunnerReport, Slot, SlotId};
