//! Probe processing module
//!
//! - Wire format for pings and pongs ([`message`])
//! - Tick-driven probe emission ([`scheduler`])
//! - Reply-to-sample conversion ([`correlator`])
//! - Run settings ([`settings`])

pub mod correlator;
pub mod message;
pub mod scheduler;
pub mod settings;
