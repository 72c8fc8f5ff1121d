// Monitoring passes and the interval loop that drives them

pub mod cycle;
pub mod runner;

pub use cycle::{CycleError, CycleMode, CycleReport, MonitorCycle, SymbolError};
pub use runner::{LoopStats, MonitorLoop};
