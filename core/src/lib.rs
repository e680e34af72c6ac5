//!
//! Ambient services shared by the stratum pool crates: logger
//! initialisation, wall-clock helpers and shutdown triggers.
//!

pub mod log;
pub mod time;
pub mod triggers;
