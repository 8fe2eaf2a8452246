/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert types shared across the runtime's sub-protocols.
//!
//! [`basic`] holds the newtype identifiers and counters that appear in the shared state
//! table and on the wire; [`hlc`] holds the hybrid logical clock used to timestamp
//! persistent versions.

pub mod basic;

pub mod hlc;

pub use basic::{
    Endpoints, FunctionId, NodeId, SeqNum, ShardIndex, SubgroupId, TypeId, Version, Vid,
    WindowSize,
};
pub use hlc::{HlcTimestamp, HybridClock};
