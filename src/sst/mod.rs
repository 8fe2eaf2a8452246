/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The shared state table: a fixed-schema, row-per-member structure that is the
//! coordination substrate for both the membership service and the ordered multicast
//! engine.
//!
//! Each member owns exactly one row and only ever writes that row; peers' rows are
//! mirrors updated as one-sided writes arrive from the fabric. A write publishes a
//! selected set of columns of the local row ([`SharedStateTable::make_patch`]);
//! ordering is per-write, so a monotone counter observed by any reader never appears
//! to decrease as long as the fabric delivers each pair's writes in FIFO order.
//!
//! The schema is fixed at construction: the size parameters (members `N`, subgroups
//! `S`, (subgroup, sender) pairs `R`, change-ring capacity `C`) are immutable for the
//! life of the instance. On every view install a fresh table is built, sized for the
//! new view, and the membership columns of the local row are carried over with
//! [`SharedStateTable::init_local_row_from_previous`].

pub mod predicates;

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

use crate::error::GroupError;
use crate::types::basic::{Endpoints, NodeId, SeqNum, Vid};
use crate::types::hlc::wall_clock_nanos;

/// Selects columns of a row for publication or application. Columns can be combined
/// with `|`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ColumnSet(u32);

impl ColumnSet {
    pub const VID: ColumnSet = ColumnSet(1 << 0);
    pub const SUSPECTED: ColumnSet = ColumnSet(1 << 1);
    pub const CHANGES: ColumnSet = ColumnSet(1 << 2);
    pub const JOINER_ENDPOINTS: ColumnSet = ColumnSet(1 << 3);
    pub const NUM_CHANGES: ColumnSet = ColumnSet(1 << 4);
    pub const NUM_COMMITTED: ColumnSet = ColumnSet(1 << 5);
    pub const NUM_ACKED: ColumnSet = ColumnSet(1 << 6);
    pub const NUM_INSTALLED: ColumnSet = ColumnSet(1 << 7);
    pub const WEDGED: ColumnSet = ColumnSet(1 << 8);
    pub const SEQ_NUM: ColumnSet = ColumnSet(1 << 9);
    pub const STABLE_NUM: ColumnSet = ColumnSet(1 << 10);
    pub const DELIVERED_NUM: ColumnSet = ColumnSet(1 << 11);
    pub const PERSISTED_NUM: ColumnSet = ColumnSet(1 << 12);
    pub const NUM_RECEIVED: ColumnSet = ColumnSet(1 << 13);
    pub const GLOBAL_MIN: ColumnSet = ColumnSet(1 << 14);
    pub const GLOBAL_MIN_READY: ColumnSet = ColumnSet(1 << 15);
    pub const FRONTIER: ColumnSet = ColumnSet(1 << 16);

    pub const fn empty() -> ColumnSet {
        ColumnSet(0)
    }

    /// Every column: used when republishing the full row after a view install.
    pub const fn all() -> ColumnSet {
        ColumnSet((1 << 17) - 1)
    }

    pub fn contains(&self, other: ColumnSet) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ColumnSet {
    type Output = ColumnSet;
    fn bitor(self, rhs: ColumnSet) -> ColumnSet {
        ColumnSet(self.0 | rhs.0)
    }
}

/// One row of the table. All fields are plain fixed-width values; the vectors have
/// lengths fixed by the table's size parameters.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct SstRow {
    /// View this row is speaking about.
    pub vid: Vid,
    /// One flag per current member: the row owner's suspicion of each peer.
    pub suspected: Vec<bool>,
    /// Ring of proposed membership deltas. The valid entries are those at ring slots
    /// `num_installed..num_changes`. A change naming a current member is a departure;
    /// one naming a non-member is a join.
    pub changes: Vec<NodeId>,
    /// For a join at ring slot `i`, the joiner's addressing record; unset otherwise.
    pub joiner_endpoints: Vec<Endpoints>,
    /// How many changes to the view have been proposed. Monotone.
    pub num_changes: i32,
    /// How many proposed changes have reached the commit point. Monotone.
    pub num_committed: i32,
    /// How many proposed changes this row's owner has seen and acknowledged. It is an
    /// error for this to exceed `num_changes`.
    pub num_acked: i32,
    /// How many changes have been installed into views so far. Monotone, lower bound
    /// on `num_committed`.
    pub num_installed: i32,
    /// The row owner has stopped sending in the current view.
    pub wedged: bool,
    /// Per subgroup: highest sequence number received in-order by the owner, in the
    /// round-robin encoding.
    pub seq_num: Vec<SeqNum>,
    /// Per subgroup: highest sequence number the owner believes every shard member
    /// has received.
    pub stable_num: Vec<SeqNum>,
    /// Per subgroup: highest sequence number delivered at the owner. Messages are
    /// only delivered once stable, so this never exceeds `stable_num`.
    pub delivered_num: Vec<SeqNum>,
    /// Per subgroup: sequence number of the latest version known persisted at the
    /// owner. Updated by the persistence manager.
    pub persisted_num: Vec<SeqNum>,
    /// Per (subgroup, sender): count of messages received in-order from that sender.
    pub num_received: Vec<i32>,
    /// Per (subgroup, sender): how many messages to accept from that sender in the
    /// current view change. Published by shard leaders.
    pub global_min: Vec<i32>,
    /// Per subgroup: whether the shard leader has published `global_min` for the
    /// current view change.
    pub global_min_ready: Vec<bool>,
    /// Per subgroup: liveness timestamp (nanoseconds since epoch), used to detect
    /// stalled peers.
    pub local_stability_frontier: Vec<u64>,
}

impl SstRow {
    fn new(vid: Vid, sizes: &TableSizes) -> SstRow {
        let now = wall_clock_nanos();
        SstRow {
            vid,
            suspected: vec![false; sizes.num_members],
            changes: vec![NodeId::new(0); sizes.change_capacity],
            joiner_endpoints: vec![Endpoints::unset(); sizes.change_capacity],
            num_changes: 0,
            num_committed: 0,
            num_acked: 0,
            num_installed: 0,
            wedged: false,
            seq_num: vec![SeqNum::init(); sizes.num_subgroups],
            stable_num: vec![SeqNum::init(); sizes.num_subgroups],
            delivered_num: vec![SeqNum::init(); sizes.num_subgroups],
            persisted_num: vec![SeqNum::init(); sizes.num_subgroups],
            num_received: vec![0; sizes.num_received_size],
            global_min: vec![0; sizes.num_received_size],
            global_min_ready: vec![false; sizes.num_subgroups],
            local_stability_frontier: vec![now; sizes.num_subgroups],
        }
    }

    /// Copy the selected columns of `from` into this row.
    fn apply(&mut self, columns: ColumnSet, from: &SstRow) {
        if columns.contains(ColumnSet::VID) {
            self.vid = from.vid;
        }
        if columns.contains(ColumnSet::SUSPECTED) {
            self.suspected.clone_from(&from.suspected);
        }
        if columns.contains(ColumnSet::CHANGES) {
            self.changes.clone_from(&from.changes);
        }
        if columns.contains(ColumnSet::JOINER_ENDPOINTS) {
            self.joiner_endpoints.clone_from(&from.joiner_endpoints);
        }
        if columns.contains(ColumnSet::NUM_CHANGES) {
            self.num_changes = from.num_changes;
        }
        if columns.contains(ColumnSet::NUM_COMMITTED) {
            self.num_committed = from.num_committed;
        }
        if columns.contains(ColumnSet::NUM_ACKED) {
            self.num_acked = from.num_acked;
        }
        if columns.contains(ColumnSet::NUM_INSTALLED) {
            self.num_installed = from.num_installed;
        }
        if columns.contains(ColumnSet::WEDGED) {
            self.wedged = from.wedged;
        }
        if columns.contains(ColumnSet::SEQ_NUM) {
            self.seq_num.clone_from(&from.seq_num);
        }
        if columns.contains(ColumnSet::STABLE_NUM) {
            self.stable_num.clone_from(&from.stable_num);
        }
        if columns.contains(ColumnSet::DELIVERED_NUM) {
            self.delivered_num.clone_from(&from.delivered_num);
        }
        if columns.contains(ColumnSet::PERSISTED_NUM) {
            self.persisted_num.clone_from(&from.persisted_num);
        }
        if columns.contains(ColumnSet::NUM_RECEIVED) {
            self.num_received.clone_from(&from.num_received);
        }
        if columns.contains(ColumnSet::GLOBAL_MIN) {
            self.global_min.clone_from(&from.global_min);
        }
        if columns.contains(ColumnSet::GLOBAL_MIN_READY) {
            self.global_min_ready.clone_from(&from.global_min_ready);
        }
        if columns.contains(ColumnSet::FRONTIER) {
            self.local_stability_frontier
                .clone_from(&from.local_stability_frontier);
        }
    }

    /// True if applying `from` would make one of the monotone counters go backwards,
    /// which single-writer rows over a FIFO fabric can never legitimately produce.
    fn would_regress(&self, columns: ColumnSet, from: &SstRow) -> bool {
        (columns.contains(ColumnSet::NUM_CHANGES) && from.num_changes < self.num_changes)
            || (columns.contains(ColumnSet::NUM_COMMITTED)
                && from.num_committed < self.num_committed)
            || (columns.contains(ColumnSet::NUM_ACKED) && from.num_acked < self.num_acked)
            || (columns.contains(ColumnSet::NUM_INSTALLED)
                && from.num_installed < self.num_installed)
            || (columns.contains(ColumnSet::SEQ_NUM)
                && regresses(&from.seq_num, &self.seq_num))
            || (columns.contains(ColumnSet::STABLE_NUM)
                && regresses(&from.stable_num, &self.stable_num))
            || (columns.contains(ColumnSet::DELIVERED_NUM)
                && regresses(&from.delivered_num, &self.delivered_num))
            || (columns.contains(ColumnSet::PERSISTED_NUM)
                && regresses(&from.persisted_num, &self.persisted_num))
    }
}

fn regresses(new: &[SeqNum], old: &[SeqNum]) -> bool {
    new.len() == old.len() && new.iter().zip(old).any(|(n, o)| n < o)
}

impl Display for SstRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vid={} changes={}/{}/{}/{} wedged={} seq={:?} stable={:?} delivered={:?} persisted={:?}",
            self.vid,
            self.num_changes,
            self.num_committed,
            self.num_acked,
            self.num_installed,
            self.wedged,
            self.seq_num.iter().map(|s| s.int()).collect::<Vec<_>>(),
            self.stable_num.iter().map(|s| s.int()).collect::<Vec<_>>(),
            self.delivered_num.iter().map(|s| s.int()).collect::<Vec<_>>(),
            self.persisted_num.iter().map(|s| s.int()).collect::<Vec<_>>(),
        )
    }
}

/// A published byte range of one row: the owner's identity, the view the row speaks
/// about, and the selected columns. The receiver copies only the selected columns
/// into its mirror of the row.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct RowPatch {
    pub sender: NodeId,
    pub vid: Vid,
    pub columns: ColumnSet,
    pub row: SstRow,
}

/// The size parameters of a table instance, immutable for its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableSizes {
    /// Members in the view.
    pub num_members: usize,
    /// Subgroups in the view (across all types).
    pub num_subgroups: usize,
    /// Total (subgroup, sender) pairs, the length of `num_received`/`global_min`.
    pub num_received_size: usize,
    /// Capacity of the change ring.
    pub change_capacity: usize,
}

impl TableSizes {
    /// The change ring holds up to 100 pending changes beyond one per member, the
    /// original provisioning rule.
    pub fn change_capacity_for(num_members: usize) -> usize {
        100 + num_members
    }
}

/// One member's instance of the shared state table.
pub struct SharedStateTable {
    sizes: TableSizes,
    members: Vec<NodeId>,
    my_rank: usize,
    rows: Vec<SstRow>,
    frozen: Vec<bool>,
}

impl SharedStateTable {
    /// Build a fresh table for the given view membership. Every row starts at the
    /// identity values with its liveness frontier at the current time.
    pub fn new(vid: Vid, members: Vec<NodeId>, my_rank: usize, sizes: TableSizes) -> SharedStateTable {
        debug_assert_eq!(members.len(), sizes.num_members);
        let rows = (0..sizes.num_members)
            .map(|_| SstRow::new(vid, &sizes))
            .collect();
        SharedStateTable {
            sizes,
            members,
            my_rank,
            rows,
            frozen: vec![false; sizes.num_members],
        }
    }

    pub fn sizes(&self) -> &TableSizes {
        &self.sizes
    }

    pub fn vid(&self) -> Vid {
        self.rows[self.my_rank].vid
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, rank: usize) -> &SstRow {
        &self.rows[rank]
    }

    pub fn local_row(&self) -> &SstRow {
        &self.rows[self.my_rank]
    }

    pub fn local_row_mut(&mut self) -> &mut SstRow {
        &mut self.rows[self.my_rank]
    }

    /// Ring slot for change-counter position `i`.
    pub fn change_slot(&self, position: i32) -> usize {
        position as usize % self.sizes.change_capacity
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    /// Mark a row unreadable after a confirmed failure, so predicates ignore it.
    pub fn freeze(&mut self, rank: usize) {
        self.frozen[rank] = true;
    }

    pub fn is_frozen(&self, rank: usize) -> bool {
        self.frozen[rank]
    }

    /// Iterate over the ranks whose rows are live (not frozen).
    pub fn live_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rows.len()).filter(move |r| !self.frozen[*r])
    }

    /// Package the selected columns of the local row for publication to every peer's
    /// mirror. The caller hands the patch to the fabric.
    pub fn make_patch(&self, columns: ColumnSet) -> RowPatch {
        RowPatch {
            sender: self.members[self.my_rank],
            vid: self.rows[self.my_rank].vid,
            columns,
            row: self.rows[self.my_rank].clone(),
        }
    }

    /// Apply a peer's published patch to its mirrored row.
    ///
    /// Patches speaking about a different view are dropped: after an install every
    /// member republishes its full row, so a dropped stale patch is always repaired
    /// by a later one. Patches for frozen rows are dropped. Returns whether the
    /// mirror changed.
    pub fn apply_patch(&mut self, patch: &RowPatch) -> Result<bool, GroupError> {
        if patch.vid != self.vid() {
            return Ok(false);
        }
        let rank = match self.rank_of(patch.sender) {
            Some(rank) => rank,
            None => return Ok(false),
        };
        if self.frozen[rank] || rank == self.my_rank {
            return Ok(false);
        }
        if self.rows[rank].would_regress(patch.columns, &patch.row) {
            return Err(GroupError::ProtocolViolation(format!(
                "row of node {} regressed a monotone counter",
                patch.sender
            )));
        }
        self.rows[rank].apply(patch.columns, &patch.row);
        Ok(true)
    }

    /// Initialize the local row of this table from the local row of the previous
    /// view's table: carry `num_changes`, `num_committed` and `num_acked`, advance
    /// `num_installed` by the number of changes just installed, and copy the residual
    /// not-yet-installed entries of the change ring. All other columns keep their
    /// identity values.
    pub fn init_local_row_from_previous(&mut self, previous: &SstRow, num_changes_installed: i32) {
        let capacity = self.sizes.change_capacity;
        let row = &mut self.rows[self.my_rank];
        row.num_changes = previous.num_changes;
        row.num_committed = previous.num_committed;
        row.num_acked = previous.num_acked;
        row.num_installed = previous.num_installed + num_changes_installed;
        for position in row.num_installed..row.num_changes {
            let slot = position as usize % capacity;
            row.changes[slot] = previous.changes[position as usize % previous.changes.len()];
            row.joiner_endpoints[slot] =
                previous.joiner_endpoints[position as usize % previous.joiner_endpoints.len()];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> TableSizes {
        TableSizes {
            num_members: 3,
            num_subgroups: 2,
            num_received_size: 5,
            change_capacity: TableSizes::change_capacity_for(3),
        }
    }

    fn members() -> Vec<NodeId> {
        vec![NodeId::new(10), NodeId::new(11), NodeId::new(12)]
    }

    #[test]
    fn patches_apply_only_selected_columns() {
        let mut alice = SharedStateTable::new(Vid::init(), members(), 0, sizes());
        let mut bob = SharedStateTable::new(Vid::init(), members(), 1, sizes());

        bob.local_row_mut().num_changes = 2;
        bob.local_row_mut().wedged = true;
        let patch = bob.make_patch(ColumnSet::NUM_CHANGES);

        assert!(alice.apply_patch(&patch).unwrap());
        assert_eq!(alice.row(1).num_changes, 2);
        // WEDGED was not selected, so the mirror keeps its old value.
        assert!(!alice.row(1).wedged);
    }

    #[test]
    fn stale_vid_patches_are_dropped() {
        let mut alice = SharedStateTable::new(Vid::new(3), members(), 0, sizes());
        let bob = SharedStateTable::new(Vid::new(2), members(), 1, sizes());
        let patch = bob.make_patch(ColumnSet::NUM_CHANGES);
        assert!(!alice.apply_patch(&patch).unwrap());
    }

    #[test]
    fn frozen_rows_ignore_patches() {
        let mut alice = SharedStateTable::new(Vid::init(), members(), 0, sizes());
        let mut bob = SharedStateTable::new(Vid::init(), members(), 1, sizes());
        bob.local_row_mut().num_changes = 1;
        alice.freeze(1);
        assert!(!alice.apply_patch(&bob.make_patch(ColumnSet::NUM_CHANGES)).unwrap());
        assert_eq!(alice.row(1).num_changes, 0);
    }

    #[test]
    fn counter_regression_is_a_protocol_violation() {
        let mut alice = SharedStateTable::new(Vid::init(), members(), 0, sizes());
        let mut bob = SharedStateTable::new(Vid::init(), members(), 1, sizes());

        bob.local_row_mut().num_committed = 4;
        alice.apply_patch(&bob.make_patch(ColumnSet::NUM_COMMITTED)).unwrap();

        bob.local_row_mut().num_committed = 3;
        assert!(alice
            .apply_patch(&bob.make_patch(ColumnSet::NUM_COMMITTED))
            .is_err());
    }

    #[test]
    fn init_from_previous_carries_residual_changes() {
        let mut old = SharedStateTable::new(Vid::init(), members(), 0, sizes());
        {
            let row = old.local_row_mut();
            row.num_changes = 3;
            row.num_committed = 2;
            row.num_acked = 3;
            row.changes[0] = NodeId::new(12); // installed below
            row.changes[1] = NodeId::new(99);
            row.changes[2] = NodeId::new(100);
        }

        let new_members = vec![NodeId::new(10), NodeId::new(11)];
        let new_sizes = TableSizes {
            num_members: 2,
            num_subgroups: 2,
            num_received_size: 4,
            change_capacity: TableSizes::change_capacity_for(2),
        };
        let mut fresh = SharedStateTable::new(Vid::new(1), new_members, 0, new_sizes);
        fresh.init_local_row_from_previous(old.local_row(), 1);

        let row = fresh.local_row();
        assert_eq!(row.num_changes, 3);
        assert_eq!(row.num_committed, 2);
        assert_eq!(row.num_acked, 3);
        assert_eq!(row.num_installed, 1);
        // Residual uninstalled proposals survive the handoff.
        assert_eq!(row.changes[1], NodeId::new(99));
        assert_eq!(row.changes[2], NodeId::new(100));
    }
}
