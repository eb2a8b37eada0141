//! # raft-node
//!
//! why: run a raft-core node as a live cluster member on tokio
//! relations: drives raft-core under one lock, persists through raft-storage, talks through a Transport
//! what: Raft handle (rpc handlers, Start/GetState/Snapshot), election/heartbeat/apply tickers, LocalNetwork

mod error;
pub mod network;
mod raft;
mod transport;

pub use error::{RaftError, TransportError};
pub use network::LocalNetwork;
pub use raft::Raft;
pub use transport::Transport;

pub use raft_core::{ApplyMsg, RaftConfig};
