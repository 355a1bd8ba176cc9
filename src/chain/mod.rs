//! Chain access for the keeper.
//!
//! This module provides:
//! - The [`ChainClient`] trait the keeper core depends on
//! - A JSON-RPC implementation against the router contract
//! - An in-memory mock for tests and dry runs

pub mod abi;
pub mod error;
pub mod mock;
pub mod rpc;
pub mod traits;
pub mod types;

pub use error::{with_timeout, ChainError, ChainResult, FailureClass};
pub use mock::MockChainClient;
pub use rpc::RpcChainClient;
pub use traits::ChainClient;
pub use types::*;
