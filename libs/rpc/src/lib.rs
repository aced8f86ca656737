//! # TPC Partition RPC
//!
//! ## Purpose
//!
//! Routes request frames to the partition that owns them and correlates
//! the responses:
//! - Keys hash onto a fixed partition count ([`partition_for`])
//! - [`RpcClient`] resolves every partition once and holds one
//!   [`PartitionActorRef`] per partition
//! - [`PartitionActorRef::submit`] returns a [`ResponseFuture`] that carries
//!   its own deadline
//! - [`Table`] and [`Pipeline`] put a key/value surface on top
//! - [`PartitionServer`] with a [`RequestHandler`] answers requests, and
//!   [`MemoryStore`] is the in-memory reference handler
//!
//! ## Architecture Role
//!
//! ```text
//!   caller ──submit──▶ PartitionActorRef ──offer──▶ client reactor ──▶ socket
//!     ▲                                                                  │
//!     └──ResponseFuture◀──oneshot◀──pending FIFO◀──response frame◀───────┘
//! ```

mod actor_ref;
mod channel;
mod client;
mod error;
mod partition;
mod pending;
mod resolver;
mod server;
mod store;
mod table;

pub use actor_ref::{PartitionActorRef, ResponseFuture};
pub use client::{RpcClient, RpcConfig};
pub use error::{Result, RpcError};
pub use partition::{hash_to_index, murmur3_x86_32, partition_for, PartitionKey, HASH_SEED};
pub use resolver::{Destination, DestinationResolver, RoundRobinResolver};
pub use server::{PartitionServer, PartitionServerBuilder, RequestHandler};
pub use store::MemoryStore;
pub use table::{Item, Pipeline, Table};
