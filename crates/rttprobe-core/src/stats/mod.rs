//! Statistics module
//!
//! - Time-bounded rolling window with average/median ([`window`])
//! - Sequence-bounded chart series ([`series`])
//! - Per-transport state and renderer snapshots ([`store`])

pub mod series;
pub mod store;
pub mod window;
