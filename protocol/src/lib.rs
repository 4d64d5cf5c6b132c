//! regionmesh neighbor protocol
//!
//! Every node runs an aggregate-computation kernel in rounds and shares the
//! state each round produces with the nodes it is directly linked to.
//! There is no coordinator: values converge by repeated neighbor exchange.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  share data  ┌──────────┐  share data  ┌──────────┐
//!  │ Node A   │◄────────────►│ Node B   │◄────────────►│ Node C   │
//!  │ runtime  │   TCP link   │ runtime  │   TCP link   │ runtime  │
//!  └──────────┘              └──────────┘              └──────────┘
//! ```
//!
//! ## Links
//! - Each node listens on its own address and dials its known neighbors
//! - Both ends open with a HELLO carrying their id and a random nonce
//! - Two links to the same neighbor resolve to the one with the greater nonce
//! - Any I/O or decode error ends that link only
//!
//! ## Execution
//! - Each cycle the kernel sees the latest payload from every neighbor
//! - Its outbound payload is broadcast to all current links
//! - A neighbor's payload is replaced, never merged, by the next one
//!
//! The protocol is best-effort gossip: no consensus, no exactly-once
//! delivery, stale values are tolerated.

pub mod codec;
pub mod config;
pub mod error;
pub mod gossip;
pub mod lookup;
pub mod peer;
pub mod runtime;
pub mod types;

pub use codec::{Message, MessageCodec};
pub use config::{ConfigHandle, ManagerConfig, NetworkConfig};
pub use error::{ProtocolError, Result};
pub use gossip::NeighborConnectionManager;
pub use lookup::{NodeLookupService, RegionLookupService, StaticNodeLookup, StaticRegionLookup};
pub use peer::{LinkState, NeighborLink};
pub use runtime::{
    AggregateKernel, ExecutionHooks, NoHooks, NodeRuntime, RoundContext, RoundOutput,
    RuntimeConfig, RuntimeState,
};
pub use types::*;
