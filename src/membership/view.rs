/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Views and subviews.
//!
//! A view is a frozen, consistent snapshot of the group: its ordered member list,
//! failure flags, and the subgroup/shard layout cut from it. Views are replaced
//! wholesale at install time and identified by a monotonically increasing vid. A
//! [`SubView`] is one shard's own view of itself: its ordered members, per-member
//! sender flags, and delivery mode.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use crate::error::{GroupError, ProvisioningError};
use crate::sst::TableSizes;
use crate::types::basic::{Endpoints, NodeId, ShardIndex, SubgroupId, TypeId, Vid};

/// Delivery mode of a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum RpcMode {
    /// Totally-ordered multicast delivery; the default.
    Ordered,
    /// Multicast without cross-sender ordering; per-sender FIFO only.
    Unordered,
    /// Delivery directly on receipt, no stability tracking.
    Raw,
}

/// A shard's own view of itself.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SubView {
    pub mode: RpcMode,
    /// Ordered member list of this shard.
    pub members: Vec<NodeId>,
    /// Per-member flag: may this member send ordered multicasts?
    pub is_sender: Vec<bool>,
    /// Members of this shard that were not in its previous incarnation.
    pub joined: Vec<NodeId>,
    /// Members of the previous incarnation no longer present.
    pub departed: Vec<NodeId>,
}

impl SubView {
    pub fn new(mode: RpcMode, members: Vec<NodeId>, is_sender: Vec<bool>) -> SubView {
        debug_assert_eq!(members.len(), is_sender.len());
        SubView {
            mode,
            members,
            is_sender,
            joined: Vec::new(),
            departed: Vec::new(),
        }
    }

    pub fn rank_of(&self, who: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == who)
    }

    /// The rank of a member among the shard's senders, or `None` if the member at
    /// `rank` is not a sender. Sender ranks index the round-robin sequence encoding.
    pub fn sender_rank_of(&self, rank: usize) -> Option<u32> {
        if !self.is_sender.get(rank).copied().unwrap_or(false) {
            return None;
        }
        Some(self.is_sender[..rank].iter().filter(|s| **s).count() as u32)
    }

    pub fn num_senders(&self) -> u32 {
        self.is_sender.iter().filter(|s| **s).count() as u32
    }

    /// The sender's node id for a given sender rank.
    pub fn sender_node(&self, sender_rank: u32) -> Option<NodeId> {
        let mut seen = 0;
        for (rank, is_sender) in self.is_sender.iter().enumerate() {
            if *is_sender {
                if seen == sender_rank {
                    return Some(self.members[rank]);
                }
                seen += 1;
            }
        }
        None
    }
}

/// A consistent snapshot of the group's membership and layout.
#[derive(Clone, Debug)]
pub struct View {
    /// Monotonically increasing view id; changes on every install.
    pub vid: Vid,
    /// Rank → node id. Every id appears at most once.
    pub members: Vec<NodeId>,
    /// Rank → addressing record.
    pub endpoints: Vec<Endpoints>,
    /// Rank → failed flag. Unordered at the table level; the view freezes a
    /// consistent snapshot at install and the flags only ever go from false to true
    /// within a view.
    pub failed: Vec<bool>,
    /// Ids that joined relative to the previous view.
    pub joined: Vec<NodeId>,
    /// Ids that departed relative to the previous view.
    pub departed: Vec<NodeId>,
    /// This node's rank in `members`, or `None` for a nonmember observer.
    pub my_rank: Option<usize>,
    /// First rank not yet consumed by the allocation function.
    pub next_unassigned_rank: usize,
    /// The registered replicated types, in allocation order.
    pub subgroup_type_order: Vec<TypeId>,
    /// Subgroup ids belonging to each registered type, in allocation order.
    pub subgroup_ids_by_type: HashMap<TypeId, Vec<SubgroupId>>,
    /// `subgroup_shard_views[s][k]` is the subview of shard `k` of subgroup `s`.
    pub subgroup_shard_views: Vec<Vec<SubView>>,
    /// For each subgroup this node belongs to, the shard it is in.
    pub my_subgroups: HashMap<SubgroupId, ShardIndex>,
    /// Whether the allocation function succeeded for every declared type. In an
    /// inadequate view membership continues to evolve but nothing is delivered.
    pub adequate: bool,
    node_id_to_rank: HashMap<NodeId, usize>,
}

impl View {
    /// Build a view with no layout yet; the allocation pass fills in the subgroup
    /// fields and `adequate`.
    pub fn new(
        vid: Vid,
        members: Vec<NodeId>,
        endpoints: Vec<Endpoints>,
        failed: Vec<bool>,
        joined: Vec<NodeId>,
        departed: Vec<NodeId>,
        my_id: NodeId,
        subgroup_type_order: Vec<TypeId>,
    ) -> View {
        let node_id_to_rank: HashMap<NodeId, usize> = members
            .iter()
            .enumerate()
            .map(|(rank, id)| (*id, rank))
            .collect();
        let my_rank = node_id_to_rank.get(&my_id).copied();
        View {
            vid,
            members,
            endpoints,
            failed,
            joined,
            departed,
            my_rank,
            next_unassigned_rank: 0,
            subgroup_type_order,
            subgroup_ids_by_type: HashMap::new(),
            subgroup_shard_views: Vec::new(),
            my_subgroups: HashMap::new(),
            adequate: false,
            node_id_to_rank,
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn num_failed(&self) -> usize {
        self.failed.iter().filter(|f| **f).count()
    }

    pub fn rank_of(&self, who: NodeId) -> Option<usize> {
        self.node_id_to_rank.get(&who).copied()
    }

    /// The leader is the lowest-ranked non-failed member.
    pub fn rank_of_leader(&self) -> Option<usize> {
        (0..self.members.len()).find(|r| !self.failed[*r])
    }

    pub fn i_am_leader(&self) -> bool {
        self.my_rank.is_some() && self.rank_of_leader() == self.my_rank
    }

    /// Cut a subview over the given members. Fails with a tagged provisioning error
    /// if any named id is not in this view.
    pub fn make_subview(
        &self,
        with_members: &[NodeId],
        mode: RpcMode,
        is_sender: Option<Vec<bool>>,
    ) -> Result<SubView, ProvisioningError> {
        for id in with_members {
            if self.rank_of(*id).is_none() {
                return Err(ProvisioningError::UnknownMember(*id));
            }
        }
        let is_sender = is_sender.unwrap_or_else(|| vec![true; with_members.len()]);
        Ok(SubView::new(mode, with_members.to_vec(), is_sender))
    }

    /// The shard leader: the member of the shard with the lowest shard rank whose
    /// group rank is not failed.
    pub fn shard_leader(&self, subgroup: SubgroupId, shard: ShardIndex) -> Option<NodeId> {
        let subview = self
            .subgroup_shard_views
            .get(subgroup.index())?
            .get(shard.int() as usize)?;
        subview
            .members
            .iter()
            .find(|m| {
                self.rank_of(**m)
                    .map(|r| !self.failed[r])
                    .unwrap_or(false)
            })
            .copied()
    }

    /// This node's subview of a subgroup, if it is a member of one of its shards.
    pub fn my_subview(&self, subgroup: SubgroupId) -> Option<&SubView> {
        let shard = self.my_subgroups.get(&subgroup)?;
        self.subgroup_shard_views
            .get(subgroup.index())?
            .get(shard.int() as usize)
    }

    pub fn num_subgroups(&self) -> usize {
        self.subgroup_shard_views.len()
    }

    /// The table size parameters this view induces: one sequence-counter slot per
    /// subgroup and one `num_received` slot per (subgroup, sender) pair, flattened
    /// in subgroup order.
    pub fn table_sizes(&self) -> TableSizes {
        TableSizes {
            num_members: self.members.len(),
            num_subgroups: self.num_subgroups(),
            num_received_size: self
                .subgroup_shard_views
                .iter()
                .map(|shards| {
                    shards
                        .iter()
                        .map(|sv| sv.num_senders() as usize)
                        .max()
                        .unwrap_or(0)
                })
                .sum(),
            change_capacity: TableSizes::change_capacity_for(self.members.len()),
        }
    }

    /// Offset of a subgroup's sender slots inside the flattened
    /// `num_received`/`global_min` columns.
    pub fn num_received_offset(&self, subgroup: SubgroupId) -> usize {
        self.subgroup_shard_views[..subgroup.index()]
            .iter()
            .map(|shards| {
                shards
                    .iter()
                    .map(|sv| sv.num_senders() as usize)
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Check the structural invariants: every id appears at most once, every shard
    /// of every subgroup present is non-empty, and the leader is uniquely defined.
    pub fn validate(&self) -> Result<(), GroupError> {
        if self.node_id_to_rank.len() != self.members.len() {
            return Err(GroupError::ProtocolViolation(String::from(
                "duplicate node id in view members",
            )));
        }
        for (s, shards) in self.subgroup_shard_views.iter().enumerate() {
            for (k, subview) in shards.iter().enumerate() {
                if subview.members.is_empty() {
                    return Err(GroupError::ProtocolViolation(format!(
                        "shard ({s}, {k}) is empty"
                    )));
                }
            }
        }
        if self.num_failed() >= self.members.len() && !self.members.is_empty() {
            return Err(GroupError::ProtocolViolation(String::from(
                "every member of the view is failed",
            )));
        }
        Ok(())
    }

    /// The serializable form shipped to joining nodes.
    pub fn to_wire(&self) -> WireView {
        WireView {
            vid: self.vid,
            members: self.members.clone(),
            endpoints: self.endpoints.clone(),
            failed: self.failed.clone(),
            joined: self.joined.clone(),
            departed: self.departed.clone(),
            subgroup_type_order: self.subgroup_type_order.clone(),
            subgroup_ids_by_type: self
                .subgroup_type_order
                .iter()
                .map(|t| {
                    (
                        *t,
                        self.subgroup_ids_by_type.get(t).cloned().unwrap_or_default(),
                    )
                })
                .collect(),
            subgroup_shard_views: self.subgroup_shard_views.clone(),
            adequate: self.adequate,
        }
    }

    /// Rebuild a view from its wire form. `my_rank` and the membership maps are
    /// recomputed at the receiver; `next_unassigned_rank` is not carried because each
    /// node re-runs the allocation function independently.
    pub fn from_wire(wire: WireView, my_id: NodeId) -> View {
        let mut view = View::new(
            wire.vid,
            wire.members,
            wire.endpoints,
            wire.failed,
            wire.joined,
            wire.departed,
            my_id,
            wire.subgroup_type_order,
        );
        view.subgroup_ids_by_type = wire.subgroup_ids_by_type.into_iter().collect();
        view.subgroup_shard_views = wire.subgroup_shard_views;
        view.adequate = wire.adequate;
        view.rebuild_my_subgroups();
        view
    }

    /// Recompute `my_subgroups` from the shard layout and `my_rank`.
    pub fn rebuild_my_subgroups(&mut self) {
        self.my_subgroups.clear();
        let me = match self.my_rank {
            Some(rank) => self.members[rank],
            None => return,
        };
        for (s, shards) in self.subgroup_shard_views.iter().enumerate() {
            for (k, subview) in shards.iter().enumerate() {
                if subview.rank_of(me).is_some() {
                    self.my_subgroups
                        .insert(SubgroupId::new(s as u32), ShardIndex::new(k as u32));
                }
            }
        }
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "View {}: Members={{", self.vid)?;
        for m in &self.members {
            write!(f, " {m}")?;
        }
        write!(f, " }}, Failed={{")?;
        for failed in &self.failed {
            write!(f, " {}", if *failed { "T" } else { "F" })?;
        }
        write!(f, " }}, Departed={{")?;
        for d in &self.departed {
            write!(f, " {d}")?;
        }
        write!(f, " }}, Joined={{")?;
        for j in &self.joined {
            write!(f, " {j}")?;
        }
        write!(f, " }}. SubViews:")?;
        for (s, shards) in self.subgroup_shard_views.iter().enumerate() {
            for (k, subview) in shards.iter().enumerate() {
                write!(f, " Shard ({s}, {k}): Members={{")?;
                for m in &subview.members {
                    write!(f, " {m}")?;
                }
                write!(f, " }}, is_sender={{")?;
                for sender in &subview.is_sender {
                    write!(f, " {}", if *sender { "T" } else { "F" })?;
                }
                write!(f, " }}.")?;
            }
        }
        Ok(())
    }
}

/// The serializable subset of a [`View`] shipped to joining nodes.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct WireView {
    pub vid: Vid,
    pub members: Vec<NodeId>,
    pub endpoints: Vec<Endpoints>,
    pub failed: Vec<bool>,
    pub joined: Vec<NodeId>,
    pub departed: Vec<NodeId>,
    pub subgroup_type_order: Vec<TypeId>,
    pub subgroup_ids_by_type: Vec<(TypeId, Vec<SubgroupId>)>,
    pub subgroup_shard_views: Vec<Vec<SubView>>,
    pub adequate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoints(n: usize) -> Vec<Endpoints> {
        (0..n)
            .map(|i| Endpoints::new(Ipv4Addr::new(10, 0, 0, i as u8), 1, 2, 3, 4))
            .collect()
    }

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().map(|i| NodeId::new(*i)).collect()
    }

    fn view(members: &[u32], failed: &[bool], me: u32) -> View {
        View::new(
            Vid::init(),
            ids(members),
            endpoints(members.len()),
            failed.to_vec(),
            Vec::new(),
            Vec::new(),
            NodeId::new(me),
            Vec::new(),
        )
    }

    #[test]
    fn leader_is_lowest_ranked_non_failed_member() {
        let v = view(&[5, 6, 7], &[false, false, false], 6);
        assert_eq!(v.rank_of_leader(), Some(0));
        assert!(!v.i_am_leader());

        let v = view(&[5, 6, 7], &[true, false, false], 6);
        assert_eq!(v.rank_of_leader(), Some(1));
        assert!(v.i_am_leader());
    }

    #[test]
    fn sender_rank_skips_non_senders() {
        let subview = SubView::new(
            RpcMode::Ordered,
            ids(&[1, 2, 3, 4]),
            vec![true, false, true, true],
        );
        assert_eq!(subview.num_senders(), 3);
        assert_eq!(subview.sender_rank_of(0), Some(0));
        assert_eq!(subview.sender_rank_of(1), None);
        assert_eq!(subview.sender_rank_of(2), Some(1));
        assert_eq!(subview.sender_rank_of(3), Some(2));
        assert_eq!(subview.sender_node(1), Some(NodeId::new(3)));
    }

    #[test]
    fn make_subview_rejects_unknown_members() {
        let v = view(&[1, 2, 3], &[false; 3], 1);
        assert!(v.make_subview(&ids(&[1, 2]), RpcMode::Ordered, None).is_ok());
        assert_eq!(
            v.make_subview(&ids(&[1, 9]), RpcMode::Ordered, None),
            Err(ProvisioningError::UnknownMember(NodeId::new(9)))
        );
    }

    #[test]
    fn table_sizes_flatten_sender_slots_per_subgroup() {
        let mut v = view(&[1, 2, 3, 4], &[false; 4], 1);
        v.subgroup_shard_views = vec![
            vec![SubView::new(RpcMode::Ordered, ids(&[1, 2]), vec![true, true])],
            vec![SubView::new(
                RpcMode::Ordered,
                ids(&[3, 4]),
                vec![true, false],
            )],
        ];
        let sizes = v.table_sizes();
        assert_eq!(sizes.num_subgroups, 2);
        assert_eq!(sizes.num_received_size, 3);
        assert_eq!(v.num_received_offset(SubgroupId::new(0)), 0);
        assert_eq!(v.num_received_offset(SubgroupId::new(1)), 2);
    }

    #[test]
    fn wire_round_trip_rebuilds_membership_maps() {
        let mut v = view(&[1, 2, 3], &[false; 3], 2);
        v.subgroup_shard_views = vec![vec![SubView::new(
            RpcMode::Ordered,
            ids(&[1, 2]),
            vec![true, true],
        )]];
        v.adequate = true;
        v.rebuild_my_subgroups();

        let rebuilt = View::from_wire(v.to_wire(), NodeId::new(2));
        assert_eq!(rebuilt.my_rank, Some(1));
        assert!(rebuilt.adequate);
        assert_eq!(
            rebuilt.my_subgroups.get(&SubgroupId::new(0)),
            Some(&ShardIndex::new(0))
        );
    }
}
