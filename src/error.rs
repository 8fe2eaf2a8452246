/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Error taxonomy.
//!
//! Transient faults at the per-peer level (a slow peer, a dropped point-to-point
//! connection) are handled locally: the peer is marked suspected and the membership
//! service may later remove it; no global failure is raised. Protocol-invariant
//! violations are fatal: the affected loop refuses to make progress and surfaces
//! [`GroupError::ProtocolViolation`] to the embedder.

use crate::types::basic::{NodeId, SubgroupId, Version};
use crate::types::hlc::HlcTimestamp;
use thiserror::Error;

/// Errors raised by group operations.
#[derive(Debug, Error)]
pub enum GroupError {
    /// The subgroup allocation function could not satisfy its minima in the current
    /// view. Callers retry after a view-change upcall.
    #[error("subgroup allocation cannot be satisfied in the current view")]
    InadequateView,

    /// The caller asked for a subgroup it is (or is not) a member of, opposite to the
    /// API used. Fatal for the call, not the process.
    #[error("membership in subgroup {subgroup} does not match the API used (member: {is_member})")]
    InvalidSubgroup {
        subgroup: SubgroupId,
        is_member: bool,
    },

    /// A send was attempted while the group is wedged for a view change. Retried on
    /// the next view by the caller.
    #[error("group is wedged for a view change; retry in the next view")]
    GroupWedged,

    /// `read_by_time` requested a time the runtime cannot yet answer consistently.
    /// No retry is performed by the runtime.
    #[error("timestamp {requested} is beyond the temporal frontier {frontier}")]
    TimestampBeyondFrontier {
        requested: HlcTimestamp,
        frontier: HlcTimestamp,
    },

    /// No version with the given number has been delivered for the subgroup.
    #[error("version {0} is not known for this subgroup")]
    UnknownVersion(Version),

    /// An inbound payload had a malformed header, or a cascade was routed into the
    /// FIFO. Fatal: the receive loop refuses to continue.
    #[error("invalid rpc message: {0}")]
    InvalidRpcMessage(String),

    /// A handler argument or return value did not serialize. Surfaced as the reply
    /// value for that node.
    #[error("serialization failure: {0}")]
    SerializationFailure(#[from] std::io::Error),

    /// A protocol invariant was violated (duplicate rank, negative counter, malformed
    /// state). The runtime refuses to make progress.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The group is shutting down and the operation cannot complete.
    #[error("group is shutting down")]
    ShuttingDown,
}

/// Per-entry failure inside a reply map.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// The reply will never arrive: the node was removed from the shard.
    #[error("node {0} was removed from the shard before replying")]
    NodeRemovedFromShard(NodeId),

    /// The replicated object on the calling node has been torn down; every
    /// outstanding pending result for its subgroup resolves to this.
    #[error("the calling node's replicated object was torn down")]
    CallerRemoved,

    /// The remote handler's reply did not deserialize.
    #[error("reply from node {0} failed to deserialize")]
    SerializationFailure(NodeId),
}

/// Tagged outcome of the subgroup allocation function: instead of unwinding, an
/// allocator that cannot satisfy its minima returns this and the membership service
/// marks the view inadequate.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProvisioningError {
    /// Fewer members are available than the allocation requires.
    #[error("subgroup needs {needed} members but the view has {available}")]
    TooFewMembers { needed: usize, available: usize },

    /// A member named by the allocation is not in the view.
    #[error("node {0} named by the allocation is not in the view")]
    UnknownMember(NodeId),
}
