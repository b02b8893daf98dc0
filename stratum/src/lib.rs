//! Stratum core of the Prosper mining pool: wire envelope, miner sessions,
//! the registry of connected miners and the operator command surface.

pub mod client;
pub mod connection;
pub mod error;
pub mod miner;
pub mod pending;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod server;

pub use client::{Client, ClientConfig, HandshakePolicy};
pub use error::{StratumError, StratumResult};
pub use miner::{Miner, MinerId, Submission};
pub use registry::Miners;
pub use server::{Server, ServerConfig};
