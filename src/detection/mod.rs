// Crossover detection and level proximity
// Pure functions over a stored POC level set and observed prices

pub mod crossover;
pub mod proximity;

pub use crossover::{build_events, change_percent, detect_crossings, event_id};
pub use proximity::{levels_above, nearest_level, rank_hot_symbols, HotSymbol, NearestLevel};
