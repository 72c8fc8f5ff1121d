// POC indicators: calendar windows, VWAP, and the six-level point-of-control set

pub mod periods;
pub mod poc;
pub mod vwap;

pub use periods::{PeriodKind, PeriodWindow};
pub use poc::{calculate_poc_levels, history_start, PocError};
pub use vwap::calculate_vwap;
