//!
//! Stratum server engine of a mining pool: miner connections, variable
//! difficulty, bans, and conversion of block templates into mining jobs.
//!
//! [`Network`] owns the listening sockets and one [`StratumClient`] per miner.
//! Pool-specific decisions (authorization, share validation) are delegated to
//! a [`PoolHandler`].
//!

pub mod algorithms;
pub mod client;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod generation;
pub mod merkle;
pub mod network;
pub mod protocol;
pub mod template;
pub mod utils;

pub use algorithms::{Algorithm, Family};
pub use client::{Authorization, ClientEvent, ClientInfo, PoolHandler, ShareOutcome, StratumClient, Submission};
pub use config::StratumConfig;
pub use difficulty::Difficulty;
pub use error::{Error, Result};
pub use network::{BanStatus, Network, NetworkEvent};
pub use template::{BlockTemplateRpc, Template};
