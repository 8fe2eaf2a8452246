/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Groupcast is a virtually-synchronous replicated state machine runtime: applications
//! define replicated objects, place them into sharded subgroups drawn from a dynamic
//! node membership, and invoke methods on them either as totally-ordered multicasts
//! (delivered identically at every shard member) or as point-to-point queries.
//!
//! The runtime maintains group membership under crash failures, delivers messages in a
//! globally consistent order, persists versioned object state so prior versions can be
//! recalled by version number or wall-clock time, and streams object state to joining
//! nodes so they catch up to the active view before participating.
//!
//! ## Architecture
//!
//! Everything is coordinated through a [shared state table](sst): a fixed-layout
//! row-per-node structure where each node writes only its own row and observes peers'
//! rows as one-sided writes arrive from the [fabric](fabric::Fabric). The
//! [group management service](membership) and the [ordered multicast engine](multicast)
//! are both driven by named [predicates](sst::predicates) over this table. The
//! [RPC layer](rpc) serializes typed invocations into multicast payloads and tracks
//! per-call reply maps; the [persistence hook](persistence) records delivered versions
//! and answers version- and time-indexed reads.
//!
//! Applications interact with the runtime through a [`Group`](group::Group), built with
//! a [`GroupBuilder`](group::GroupBuilder).

pub mod types;

pub mod config;

pub mod error;

pub mod fabric;

pub mod sst;

pub mod membership;

pub mod multicast;

pub mod persistence;

pub mod rpc;

pub mod group;

pub mod events;

pub(crate) mod event_bus;

pub(crate) mod logging;

// Re-exports of the main public surface.
pub use config::Configuration;
pub use error::{GroupError, ProvisioningError, ReplyError};
pub use fabric::Fabric;
pub use group::{Group, GroupBuilder, NonmemberSubgroupHandle, SubgroupHandle};
pub use membership::allocation::{AllocationFn, ShardSpec, SubgroupInfo, SubgroupSpec};
pub use membership::view::{RpcMode, SubView, View};
pub use persistence::{DurableStore, MemoryStore};
pub use rpc::pending::{QueryResults, ReplyMap};
pub use rpc::{ClassDescriptor, InvocationContext, ReplicatedObject};
pub use types::basic::{
    Endpoints, FunctionId, NodeId, SeqNum, SubgroupId, TypeId, Version, Vid,
};
pub use types::hlc::{HlcTimestamp, HybridClock};
