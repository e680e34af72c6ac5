//!
//! JSON-RPC access to the coin daemons backing the pool: block templates in,
//! solved blocks out.
//!
//! [`DaemonInterface`] talks to every configured endpoint and reports each
//! endpoint's outcome as data; [`Daemon`] adds a short-lived reply cache.
//!

pub mod config;
pub mod daemon;
pub mod error;
pub mod interface;
pub mod protocol;
pub mod transport;

pub use config::{DaemonConfig, DaemonInstance};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use interface::DaemonInterface;
pub use protocol::{RpcReply, RpcRequest, RpcResponse};
pub use transport::{HttpReply, HttpTransport, RpcTransport};
