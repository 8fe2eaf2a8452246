/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subgroup allocation.
//!
//! Every registered replicated type supplies a deterministic allocation function
//! that lays the type's subgroups and shards out over a view's members. All members
//! run the same functions over the same view and must arrive at the same layout. An
//! allocator that cannot satisfy its minima returns a tagged
//! [`ProvisioningError`] instead of unwinding; the membership service then marks the
//! view inadequate and suspends delivery until membership recovers.

use crate::error::ProvisioningError;
use crate::membership::view::{RpcMode, SubView, View};
use crate::types::basic::{NodeId, ShardIndex, SubgroupId, TypeId};

/// Requested layout of one shard: its members, optional sender flags (all members
/// send when omitted), and delivery mode.
pub struct ShardSpec {
    pub members: Vec<NodeId>,
    pub is_sender: Option<Vec<bool>>,
    pub mode: RpcMode,
}

impl ShardSpec {
    pub fn ordered(members: Vec<NodeId>) -> ShardSpec {
        ShardSpec {
            members,
            is_sender: None,
            mode: RpcMode::Ordered,
        }
    }
}

/// Requested layout of one subgroup: its shards.
pub struct SubgroupSpec {
    pub shards: Vec<ShardSpec>,
}

/// A replicated type's allocation function. Receives the view under construction and
/// the first rank not yet consumed by earlier types; returns one spec per subgroup
/// of the type.
pub type AllocationFn =
    Box<dyn Fn(&View, &mut usize) -> Result<Vec<SubgroupSpec>, ProvisioningError> + Send>;

/// The per-type allocation functions, in allocation order. The order is fixed for
/// the life of the group and defines the dense numbering of subgroups.
pub struct SubgroupInfo {
    pub layouts: Vec<(TypeId, AllocationFn)>,
}

impl SubgroupInfo {
    pub fn new() -> SubgroupInfo {
        SubgroupInfo {
            layouts: Vec::new(),
        }
    }

    pub fn add(&mut self, type_id: TypeId, allocator: AllocationFn) {
        self.layouts.push((type_id, allocator));
    }

    pub fn type_order(&self) -> Vec<TypeId> {
        self.layouts.iter().map(|(t, _)| *t).collect()
    }
}

impl Default for SubgroupInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Run every type's allocation function over the view, filling in its subgroup
/// fields. On a provisioning error the view is left with an empty layout and marked
/// inadequate; the error is returned so the caller can log it.
///
/// `previous` is the layout of the prior view, used to stamp each subview's
/// `joined`/`departed` lists relative to its previous incarnation.
pub fn apply_allocation(
    view: &mut View,
    info: &SubgroupInfo,
    previous: Option<&View>,
) -> Result<(), ProvisioningError> {
    view.subgroup_shard_views.clear();
    view.subgroup_ids_by_type.clear();
    view.my_subgroups.clear();
    view.next_unassigned_rank = 0;
    view.adequate = false;

    let mut next_unassigned = 0usize;
    let mut shard_views: Vec<Vec<SubView>> = Vec::new();
    let mut ids_by_type: Vec<(TypeId, Vec<SubgroupId>)> = Vec::new();

    for (type_id, allocator) in &info.layouts {
        let specs = match allocator(view, &mut next_unassigned) {
            Ok(specs) => specs,
            Err(e) => {
                log::warn!(
                    "allocation for type {} failed in view {}: {e}",
                    type_id.int(),
                    view.vid
                );
                return Err(e);
            }
        };
        let mut ids = Vec::new();
        for spec in specs {
            let subgroup_id = SubgroupId::new(shard_views.len() as u32);
            let mut shards = Vec::new();
            for shard in spec.shards {
                let mut subview = view.make_subview(&shard.members, shard.mode, shard.is_sender)?;
                stamp_turnover(
                    &mut subview,
                    previous,
                    subgroup_id,
                    ShardIndex::new(shards.len() as u32),
                );
                shards.push(subview);
            }
            ids.push(subgroup_id);
            shard_views.push(shards);
        }
        ids_by_type.push((*type_id, ids));
    }

    view.subgroup_shard_views = shard_views;
    view.subgroup_ids_by_type = ids_by_type.into_iter().collect();
    view.next_unassigned_rank = next_unassigned;
    view.adequate = true;
    view.rebuild_my_subgroups();
    Ok(())
}

fn stamp_turnover(
    subview: &mut SubView,
    previous: Option<&View>,
    subgroup: SubgroupId,
    shard: ShardIndex,
) {
    let old_members: &[NodeId] = previous
        .and_then(|v| v.subgroup_shard_views.get(subgroup.index()))
        .and_then(|shards| shards.get(shard.int() as usize))
        .map(|sv| sv.members.as_slice())
        .unwrap_or(&[]);
    subview.joined = subview
        .members
        .iter()
        .filter(|m| !old_members.contains(m))
        .copied()
        .collect();
    subview.departed = old_members
        .iter()
        .filter(|m| !subview.members.contains(m))
        .copied()
        .collect();
}

/// Stock allocator: one subgroup with one shard over the first `shard_size` live
/// ranks after `next_unassigned_rank`, all members senders.
pub fn contiguous_shard(shard_size: usize) -> AllocationFn {
    Box::new(move |view, next_unassigned| {
        if view.num_members() < *next_unassigned + shard_size {
            return Err(ProvisioningError::TooFewMembers {
                needed: *next_unassigned + shard_size,
                available: view.num_members(),
            });
        }
        let members = view.members[*next_unassigned..*next_unassigned + shard_size].to_vec();
        *next_unassigned += shard_size;
        Ok(vec![SubgroupSpec {
            shards: vec![ShardSpec::ordered(members)],
        }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{Endpoints, Vid};
    use std::net::Ipv4Addr;

    fn view(members: &[u32], me: u32) -> View {
        View::new(
            Vid::init(),
            members.iter().map(|i| NodeId::new(*i)).collect(),
            members
                .iter()
                .map(|i| Endpoints::new(Ipv4Addr::new(10, 0, 0, *i as u8), 1, 2, 3, 4))
                .collect(),
            vec![false; members.len()],
            Vec::new(),
            Vec::new(),
            NodeId::new(me),
            Vec::new(),
        )
    }

    #[test]
    fn contiguous_shards_consume_ranks_in_type_order() {
        let mut info = SubgroupInfo::new();
        info.add(TypeId::new(1), contiguous_shard(3));
        info.add(TypeId::new(2), contiguous_shard(3));

        let mut v = view(&[0, 1, 2, 3, 4, 5], 4);
        v.subgroup_type_order = info.type_order();
        apply_allocation(&mut v, &info, None).unwrap();

        assert!(v.adequate);
        assert_eq!(v.num_subgroups(), 2);
        assert_eq!(
            v.subgroup_shard_views[0][0].members,
            vec![NodeId::new(0), NodeId::new(1), NodeId::new(2)]
        );
        assert_eq!(
            v.subgroup_shard_views[1][0].members,
            vec![NodeId::new(3), NodeId::new(4), NodeId::new(5)]
        );
        assert_eq!(v.next_unassigned_rank, 6);
        assert_eq!(
            v.my_subgroups.get(&SubgroupId::new(1)),
            Some(&ShardIndex::new(0))
        );
    }

    #[test]
    fn under_provisioned_views_are_inadequate() {
        let mut info = SubgroupInfo::new();
        info.add(TypeId::new(1), contiguous_shard(3));

        let mut v = view(&[0, 1], 0);
        v.subgroup_type_order = info.type_order();
        let err = apply_allocation(&mut v, &info, None).unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::TooFewMembers {
                needed: 3,
                available: 2
            }
        );
        assert!(!v.adequate);
    }

    #[test]
    fn turnover_is_stamped_per_shard() {
        let mut info = SubgroupInfo::new();
        info.add(TypeId::new(1), contiguous_shard(2));

        let mut old = view(&[0, 1, 2], 0);
        old.subgroup_type_order = info.type_order();
        apply_allocation(&mut old, &info, None).unwrap();

        // Node 1 departs; node 2 takes its slot in the shard.
        let mut new = view(&[0, 2], 0);
        new.subgroup_type_order = info.type_order();
        apply_allocation(&mut new, &info, Some(&old)).unwrap();

        let subview = &new.subgroup_shard_views[0][0];
        assert_eq!(subview.joined, vec![NodeId::new(2)]);
        assert_eq!(subview.departed, vec![NodeId::new(1)]);
    }
}
