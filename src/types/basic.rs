/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Newtype identifiers and counters.
//!
//! These follow the newtype pattern: they are sent around and inspected but have no
//! active behavior, and the API for using them is defined here. All of them have a
//! fixed wire width so that rows of the shared state table keep a fixed layout.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::ops::{Add, AddAssign, Sub};

/// Identity of a node, unique within the lifetime of a group instance. Node ids are
/// never reused across views within one group instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// View identifier. Vids monotonically increase as views change; every install
/// advances the vid by exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Vid(i32);

impl Vid {
    pub const fn new(int: i32) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> i32 {
        self.0
    }

    pub fn next(&self) -> Vid {
        Vid(self.0 + 1)
    }
}

impl Display for Vid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index of a subgroup within a view. Subgroups are numbered densely, in the order
/// induced by the view's subgroup type order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct SubgroupId(u32);

impl SubgroupId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub(crate) const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for SubgroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index of a shard within a subgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ShardIndex(u32);

impl ShardIndex {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Identity of a registered replicated type (the `class_id` of the RPC header).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct TypeId(u32);

impl TypeId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Identity of a method on a registered replicated type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct FunctionId(u32);

impl FunctionId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// A sequence number in the round-robin global order of one subgroup.
///
/// For a subgroup with `M` senders, the message with sender rank `s` and per-sender
/// index `i` has sequence number `s + M·i`. The correct global order of messages is
/// the natural order of these numbers: with 4 senders, (0,0), (1,0), (2,0), (3,0),
/// (0,1), (1,1), ... is 0, 1, 2, 3, 4, 5, ....
///
/// `SeqNum(-1)` is the identity: no message has been received, stabilized, delivered
/// or persisted yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct SeqNum(i64);

impl SeqNum {
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(-1)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    /// Encode `(sender_rank, index)` for a subgroup with `num_senders` senders.
    pub fn encode(sender_rank: u32, index: i64, num_senders: u32) -> SeqNum {
        SeqNum(sender_rank as i64 + num_senders as i64 * index)
    }

    /// The sender rank this sequence number belongs to, for a subgroup with
    /// `num_senders` senders.
    pub fn sender_rank(&self, num_senders: u32) -> u32 {
        (self.0.rem_euclid(num_senders as i64)) as u32
    }

    /// The per-sender message index this sequence number encodes.
    pub fn sender_index(&self, num_senders: u32) -> i64 {
        self.0.div_euclid(num_senders as i64)
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i64> for SeqNum {
    type Output = SeqNum;
    fn add(self, rhs: i64) -> SeqNum {
        SeqNum(self.0 + rhs)
    }
}

impl Sub<SeqNum> for SeqNum {
    type Output = i64;
    fn sub(self, rhs: SeqNum) -> i64 {
        self.0 - rhs.0
    }
}

/// A persistent version number. Versions are dense and monotone per subgroup,
/// assigned at delivery time starting from 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Version(i64);

impl Version {
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<i64> for Version {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

/// Number of in-flight messages allowed per sender per subgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WindowSize(u32);

impl WindowSize {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// The addressing record of a node: its IP address and the ports of the four
/// transport endpoints.
///
/// The IP is packed into a `u32` in network byte order so the record has a fixed
/// wire width and can travel inside shared state table rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Endpoints {
    ip: u32,
    pub gms_port: u16,
    pub rdma_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
}

impl Endpoints {
    pub fn new(ip: Ipv4Addr, gms_port: u16, rdma_port: u16, rpc_port: u16, sst_port: u16) -> Self {
        Self {
            ip: u32::from(ip),
            gms_port,
            rdma_port,
            rpc_port,
            sst_port,
        }
    }

    /// The all-zero record, used for change-ring entries that are departures rather
    /// than joins.
    pub const fn unset() -> Self {
        Self {
            ip: 0,
            gms_port: 0,
            rdma_port: 0,
            rpc_port: 0,
            sst_port: 0,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}/{}",
            self.ip(),
            self.gms_port,
            self.rdma_port,
            self.rpc_port,
            self.sst_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_num_round_robin_encoding() {
        // 4 senders: (0,0), (1,0), (2,0), (3,0), (0,1) encode as 0, 1, 2, 3, 4.
        assert_eq!(SeqNum::encode(0, 0, 4), SeqNum::new(0));
        assert_eq!(SeqNum::encode(3, 0, 4), SeqNum::new(3));
        assert_eq!(SeqNum::encode(0, 1, 4), SeqNum::new(4));
        assert_eq!(SeqNum::encode(2, 5, 4), SeqNum::new(22));
    }

    #[test]
    fn seq_num_decoding_inverts_encoding() {
        for sender in 0..3u32 {
            for index in 0..10i64 {
                let seq = SeqNum::encode(sender, index, 3);
                assert_eq!(seq.sender_rank(3), sender);
                assert_eq!(seq.sender_index(3), index);
            }
        }
    }

    #[test]
    fn endpoints_pack_ip_round_trip() {
        let ep = Endpoints::new(Ipv4Addr::new(192, 168, 1, 9), 23580, 23581, 23582, 23583);
        assert_eq!(ep.ip(), Ipv4Addr::new(192, 168, 1, 9));
        assert_eq!(ep.to_string(), "192.168.1.9:23580/23581/23582/23583");
    }
}
