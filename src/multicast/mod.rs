/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ordered multicast engine.
//!
//! Payload bodies travel on the bulk carrier; ordering and delivery are decided
//! entirely by counters in the shared state table. A sender tags each message with
//! its sender rank and per-sender index; receivers count in-order receipt per sender
//! (`num_received`), fold those counts into the highest round-robin-contiguous
//! sequence number (`seq_num`), publish the minimum they observe across the shard
//! (`stable_num`), and deliver messages in numeric sequence order once stable.
//! `delivered_num` trails the largest delivered sequence number, and for persistent
//! subgroups `persisted_num` trails the durable frontier behind it.
//!
//! On a view change the engine wedges: new sends are refused, and the shard leader's
//! published per-sender cutoffs (`global_min`) determine exactly which in-flight
//! messages every survivor delivers before the view is torn down.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

use crate::error::GroupError;
use crate::membership::view::{RpcMode, SubView};
use crate::sst::{ColumnSet, SharedStateTable, SstRow};
use crate::types::basic::{NodeId, SeqNum, SubgroupId, Vid, WindowSize};

/// An ordered-multicast message body on the bulk carrier.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct PayloadEnvelope {
    /// View the message was sent in; bodies from other views are dropped.
    pub vid: Vid,
    pub subgroup: SubgroupId,
    pub sender: NodeId,
    /// The sender's rank among the shard's senders at send time.
    pub sender_rank: u32,
    /// Per-sender message index, starting at 0 in each view.
    pub index: i64,
    pub body: Vec<u8>,
}

impl PayloadEnvelope {
    pub fn seq_num(&self, num_senders: u32) -> SeqNum {
        SeqNum::encode(self.sender_rank, self.index, num_senders)
    }
}

/// Multicast state for one subgroup this node belongs to. Lives on the core thread;
/// all table writes go through the local row.
pub struct SubgroupMulticast {
    subgroup: SubgroupId,
    subview: SubView,
    num_senders: u32,
    my_sender_rank: Option<u32>,
    /// Offset of this subgroup's sender slots in the flattened `num_received` column.
    nr_offset: usize,
    window: WindowSize,
    /// My next per-sender send index.
    next_index: i64,
    /// Per sender: messages received but not yet contiguous with the in-order prefix.
    out_of_order: Vec<BTreeMap<i64, PayloadEnvelope>>,
    /// In-order messages awaiting stability, keyed by sequence number.
    undelivered: BTreeMap<SeqNum, PayloadEnvelope>,
    wedged: bool,
    /// Set once the ragged edge has been delivered during a view change.
    flushed: bool,
}

impl SubgroupMulticast {
    pub fn new(
        subgroup: SubgroupId,
        subview: SubView,
        my_id: NodeId,
        nr_offset: usize,
        window: WindowSize,
    ) -> SubgroupMulticast {
        let num_senders = subview.num_senders();
        let my_sender_rank = subview
            .rank_of(my_id)
            .and_then(|rank| subview.sender_rank_of(rank));
        SubgroupMulticast {
            subgroup,
            subview,
            num_senders,
            my_sender_rank,
            nr_offset,
            window,
            next_index: 0,
            out_of_order: (0..num_senders).map(|_| BTreeMap::new()).collect(),
            undelivered: BTreeMap::new(),
            wedged: false,
            flushed: false,
        }
    }

    pub fn subgroup(&self) -> SubgroupId {
        self.subgroup
    }

    pub fn subview(&self) -> &SubView {
        &self.subview
    }

    pub fn mode(&self) -> RpcMode {
        self.subview.mode
    }

    pub fn num_senders(&self) -> u32 {
        self.num_senders
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// The other members of the shard, the broadcast recipients of a send.
    pub fn peers(&self, my_id: NodeId) -> Vec<NodeId> {
        self.subview
            .members
            .iter()
            .filter(|m| **m != my_id)
            .copied()
            .collect()
    }

    /// Whether a new send must wait for deliveries to drain: a send whose index
    /// exceeds `delivered_num / num_senders + window` stays in flight too long.
    pub fn window_full(&self, local_row: &SstRow) -> bool {
        let delivered = local_row.delivered_num[self.subgroup.index()];
        let delivered_rounds = if delivered == SeqNum::init() {
            0
        } else {
            delivered.sender_index(self.num_senders) + 1
        };
        self.next_index >= delivered_rounds + self.window.int() as i64
    }

    /// Stamp the next outgoing message. Fails while wedged or when this node is not
    /// a sender in the subgroup; the caller handles window backpressure separately.
    pub fn next_envelope(
        &mut self,
        vid: Vid,
        my_id: NodeId,
        body: Vec<u8>,
    ) -> Result<PayloadEnvelope, GroupError> {
        if self.wedged {
            return Err(GroupError::GroupWedged);
        }
        let sender_rank = self.my_sender_rank.ok_or(GroupError::InvalidSubgroup {
            subgroup: self.subgroup,
            is_member: false,
        })?;
        let envelope = PayloadEnvelope {
            vid,
            subgroup: self.subgroup,
            sender: my_id,
            sender_rank,
            index: self.next_index,
            body,
        };
        self.next_index += 1;
        Ok(envelope)
    }

    /// Absorb a message body (a peer's or our own) into the receive state: buffer
    /// it, extend the per-sender in-order prefix, and recompute `seq_num` as the
    /// highest round-robin-contiguous sequence number. Returns the columns of the
    /// local row that changed.
    pub fn receive(&mut self, envelope: PayloadEnvelope, local_row: &mut SstRow) -> ColumnSet {
        if envelope.sender_rank >= self.num_senders {
            log::error!(
                "dropping payload with sender rank {} in subgroup {} with {} senders",
                envelope.sender_rank,
                self.subgroup,
                self.num_senders
            );
            return ColumnSet::empty();
        }
        // Raw shards deliver on receipt; nothing is counted.
        if self.subview.mode == RpcMode::Raw {
            let seq = envelope.seq_num(self.num_senders);
            self.undelivered.insert(seq, envelope);
            return ColumnSet::empty();
        }

        let sender = envelope.sender_rank as usize;
        self.out_of_order[sender].insert(envelope.index, envelope);

        // Extend the contiguous prefix for this sender.
        let mut changed = ColumnSet::empty();
        loop {
            let next = local_row.num_received[self.nr_offset + sender] as i64;
            match self.out_of_order[sender].remove(&next) {
                Some(message) => {
                    let seq = message.seq_num(self.num_senders);
                    self.undelivered.insert(seq, message);
                    local_row.num_received[self.nr_offset + sender] += 1;
                    changed = changed | ColumnSet::NUM_RECEIVED;
                }
                None => break,
            }
        }

        let seq = self.contiguous_seq_num(local_row);
        if seq > local_row.seq_num[self.subgroup.index()] {
            local_row.seq_num[self.subgroup.index()] = seq;
            changed = changed | ColumnSet::SEQ_NUM;
        }
        changed
    }

    /// The highest sequence number `k` such that every message with sequence number
    /// `≤ k` has been received, folded from the per-sender in-order counts.
    fn contiguous_seq_num(&self, local_row: &SstRow) -> SeqNum {
        if self.num_senders == 0 {
            return SeqNum::init();
        }
        let counts =
            &local_row.num_received[self.nr_offset..self.nr_offset + self.num_senders as usize];
        let full_rounds = counts.iter().copied().min().unwrap_or(0) as i64;
        let mut prefix = 0i64;
        for count in counts {
            if (*count as i64) > full_rounds {
                prefix += 1;
            } else {
                break;
            }
        }
        SeqNum::new(self.num_senders as i64 * full_rounds - 1 + prefix)
    }

    /// Recompute `stable_num` as the minimum `seq_num` over the live members of the
    /// shard, as mirrored in the table. Returns the changed columns.
    pub fn update_stability(&self, table: &mut SharedStateTable) -> ColumnSet {
        if self.subview.mode != RpcMode::Ordered {
            return ColumnSet::empty();
        }
        let mut stable: Option<SeqNum> = None;
        for member in &self.subview.members {
            match table.rank_of(*member) {
                Some(rank) if !table.is_frozen(rank) => {
                    let seq = table.row(rank).seq_num[self.subgroup.index()];
                    stable = Some(stable.map_or(seq, |s| s.min(seq)));
                }
                _ => {}
            }
        }
        let stable = match stable {
            Some(s) => s,
            None => return ColumnSet::empty(),
        };
        let row = table.local_row_mut();
        if stable > row.stable_num[self.subgroup.index()] {
            row.stable_num[self.subgroup.index()] = stable;
            ColumnSet::STABLE_NUM
        } else {
            ColumnSet::empty()
        }
    }

    /// Drain every buffered message that may now be delivered, in numeric sequence
    /// order: up to `stable_num` for ordered shards, on receipt for the others.
    pub fn take_deliverable(&mut self, local_row: &SstRow) -> Vec<(SeqNum, PayloadEnvelope)> {
        let limit = match self.subview.mode {
            RpcMode::Ordered => local_row.stable_num[self.subgroup.index()],
            RpcMode::Unordered | RpcMode::Raw => SeqNum::new(i64::MAX),
        };
        let mut batch = Vec::new();
        while let Some(entry) = self.undelivered.first_entry() {
            if *entry.key() > limit {
                break;
            }
            let (seq, envelope) = entry.remove_entry();
            batch.push((seq, envelope));
        }
        batch
    }

    /// Stop accepting new sends for the view change. Bytes already handed to the
    /// carrier still count toward the ragged edge.
    pub fn wedge(&mut self) {
        self.wedged = true;
    }

    /// Shard-leader side of the ragged-edge flush: the per-sender cutoff is the
    /// largest in-order count reached by every live member of the shard.
    pub fn compute_global_min(&self, table: &SharedStateTable) -> Vec<i32> {
        let mut cutoffs = vec![i32::MAX; self.num_senders as usize];
        for member in &self.subview.members {
            if let Some(rank) = table.rank_of(*member) {
                if table.is_frozen(rank) {
                    continue;
                }
                let row = table.row(rank);
                for s in 0..self.num_senders as usize {
                    cutoffs[s] = cutoffs[s].min(row.num_received[self.nr_offset + s]);
                }
            }
        }
        for cutoff in cutoffs.iter_mut() {
            if *cutoff == i32::MAX {
                *cutoff = 0;
            }
        }
        cutoffs
    }

    /// Follower side of the ragged-edge flush: deliver exactly the messages below
    /// the leader's cutoffs, in sequence order, and discard the unstable remainder.
    /// Returns the final batch.
    pub fn flush_ragged_edge(&mut self, cutoffs: &[i32]) -> Vec<(SeqNum, PayloadEnvelope)> {
        self.flushed = true;
        let mut batch: Vec<(SeqNum, PayloadEnvelope)> = Vec::new();
        for (seq, envelope) in std::mem::take(&mut self.undelivered) {
            let sender = envelope.sender_rank as usize;
            if sender < cutoffs.len() && envelope.index < cutoffs[sender] as i64 {
                batch.push((seq, envelope));
            }
        }
        self.out_of_order.iter_mut().for_each(|b| b.clear());
        batch
    }

    /// The sequence number of the last message the ragged edge delivers, used to
    /// advance `delivered_num` past the flush.
    pub fn ragged_edge_seq(&self, cutoffs: &[i32]) -> SeqNum {
        let mut last = SeqNum::init();
        for (sender, cutoff) in cutoffs.iter().enumerate() {
            if *cutoff > 0 {
                let seq = SeqNum::encode(sender as u32, *cutoff as i64 - 1, self.num_senders);
                last = last.max(seq);
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::TableSizes;
    use crate::types::basic::Vid;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().map(|i| NodeId::new(*i)).collect()
    }

    fn table_for(members: &[u32], my_rank: usize, num_senders: usize) -> SharedStateTable {
        SharedStateTable::new(
            Vid::init(),
            ids(members),
            my_rank,
            TableSizes {
                num_members: members.len(),
                num_subgroups: 1,
                num_received_size: num_senders,
                change_capacity: TableSizes::change_capacity_for(members.len()),
            },
        )
    }

    fn engine(members: &[u32], me: u32) -> SubgroupMulticast {
        let subview = SubView::new(RpcMode::Ordered, ids(members), vec![true; members.len()]);
        SubgroupMulticast::new(
            SubgroupId::new(0),
            subview,
            NodeId::new(me),
            0,
            WindowSize::new(16),
        )
    }

    fn envelope(sender: u32, sender_rank: u32, index: i64) -> PayloadEnvelope {
        PayloadEnvelope {
            vid: Vid::init(),
            subgroup: SubgroupId::new(0),
            sender: NodeId::new(sender),
            sender_rank,
            index,
            body: vec![sender as u8, index as u8],
        }
    }

    #[test]
    fn seq_num_tracks_round_robin_contiguity() {
        let mut table = table_for(&[0, 1], 0, 2);
        let mut mc = engine(&[0, 1], 0);

        // (0,0) alone: seq 0 is present, seq 1 is not.
        mc.receive(envelope(0, 0, 0), table.local_row_mut());
        assert_eq!(table.local_row().seq_num[0], SeqNum::new(0));

        // (0,1) without (1,0): the round-robin order stalls at 0.
        mc.receive(envelope(0, 0, 1), table.local_row_mut());
        assert_eq!(table.local_row().seq_num[0], SeqNum::new(0));

        // (1,0) fills the gap: 0, 1, 2 are all present.
        mc.receive(envelope(1, 1, 0), table.local_row_mut());
        assert_eq!(table.local_row().seq_num[0], SeqNum::new(2));
    }

    #[test]
    fn out_of_order_arrivals_extend_the_prefix_when_filled() {
        let mut table = table_for(&[0, 1], 0, 2);
        let mut mc = engine(&[0, 1], 0);

        mc.receive(envelope(1, 1, 1), table.local_row_mut());
        assert_eq!(table.local_row().num_received[1], 0);
        mc.receive(envelope(1, 1, 0), table.local_row_mut());
        assert_eq!(table.local_row().num_received[1], 2);
    }

    #[test]
    fn delivery_stops_at_stable_num() {
        let mut table = table_for(&[0, 1], 0, 2);
        let mut mc = engine(&[0, 1], 0);

        mc.receive(envelope(0, 0, 0), table.local_row_mut());
        mc.receive(envelope(1, 1, 0), table.local_row_mut());
        mc.receive(envelope(0, 0, 1), table.local_row_mut());

        // Peer has only seen seq 0.
        table.local_row_mut().stable_num[0] = SeqNum::new(0);
        let batch = mc.take_deliverable(table.local_row());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, SeqNum::new(0));

        table.local_row_mut().stable_num[0] = SeqNum::new(2);
        let batch = mc.take_deliverable(table.local_row());
        assert_eq!(
            batch.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![SeqNum::new(1), SeqNum::new(2)]
        );
    }

    #[test]
    fn stability_is_min_over_live_rows() {
        let mut table = table_for(&[0, 1, 2], 0, 3);
        let mc = engine(&[0, 1, 2], 0);

        table.local_row_mut().seq_num[0] = SeqNum::new(5);
        // Peers' mirrored rows still at -1: nothing is stable.
        assert_eq!(mc.update_stability(&mut table), ColumnSet::empty());

        // Peer rows advance (simulated by direct mirror writes in this unit test).
        for rank in 1..3 {
            let patch = {
                let mut peer = table_for(&[0, 1, 2], rank, 3);
                peer.local_row_mut().seq_num[0] = SeqNum::new(if rank == 1 { 3 } else { 4 });
                peer.make_patch(ColumnSet::SEQ_NUM)
            };
            table.apply_patch(&patch).unwrap();
        }
        assert_eq!(mc.update_stability(&mut table), ColumnSet::STABLE_NUM);
        assert_eq!(table.local_row().stable_num[0], SeqNum::new(3));
    }

    #[test]
    fn window_blocks_until_deliveries_drain() {
        let mut table = table_for(&[0, 1], 0, 2);
        let subview = SubView::new(RpcMode::Ordered, ids(&[0, 1]), vec![true, true]);
        let mut mc = SubgroupMulticast::new(
            SubgroupId::new(0),
            subview,
            NodeId::new(0),
            0,
            WindowSize::new(2),
        );

        assert!(!mc.window_full(table.local_row()));
        mc.next_envelope(Vid::init(), NodeId::new(0), vec![]).unwrap();
        mc.next_envelope(Vid::init(), NodeId::new(0), vec![]).unwrap();
        assert!(mc.window_full(table.local_row()));

        // One full round delivered: the window slides.
        table.local_row_mut().delivered_num[0] = SeqNum::new(1);
        assert!(!mc.window_full(table.local_row()));
    }

    #[test]
    fn wedged_subgroups_refuse_sends() {
        let mut mc = engine(&[0, 1], 0);
        mc.wedge();
        assert!(matches!(
            mc.next_envelope(Vid::init(), NodeId::new(0), vec![]),
            Err(GroupError::GroupWedged)
        ));
    }

    #[test]
    fn ragged_edge_delivers_exactly_the_cutoffs() {
        let mut table = table_for(&[0, 1, 2, 3, 4], 0, 5);
        let mut mc = engine(&[0, 1, 2, 3, 4], 0);

        // Sender 2 crashed after (2,0) and (2,1); we hold both plus (0,0).
        mc.receive(envelope(0, 0, 0), table.local_row_mut());
        mc.receive(envelope(2, 2, 0), table.local_row_mut());
        mc.receive(envelope(2, 2, 1), table.local_row_mut());

        // The shard agrees everyone has (2,0) and (2,1) but only we hold (0,0).
        let cutoffs = vec![0, 0, 2, 0, 0];
        let batch = mc.flush_ragged_edge(&cutoffs);
        let delivered: Vec<(u32, i64)> = batch
            .iter()
            .map(|(_, e)| (e.sender_rank, e.index))
            .collect();
        assert_eq!(delivered, vec![(2, 0), (2, 1)]);
        assert_eq!(mc.ragged_edge_seq(&cutoffs), SeqNum::encode(2, 1, 5));
        assert!(mc.is_flushed());
    }

    #[test]
    fn global_min_is_computed_over_live_members_only() {
        let mut table = table_for(&[0, 1, 2], 0, 3);
        let mc = engine(&[0, 1, 2], 0);

        table.local_row_mut().num_received[0] = 2;
        table.local_row_mut().num_received[1] = 1;
        for rank in 1..3 {
            let patch = {
                let mut peer = table_for(&[0, 1, 2], rank, 3);
                peer.local_row_mut().num_received[0] = 3;
                peer.local_row_mut().num_received[1] = rank as i32;
                peer.make_patch(ColumnSet::NUM_RECEIVED)
            };
            table.apply_patch(&patch).unwrap();
        }
        table.freeze(2);

        assert_eq!(mc.compute_global_min(&table), vec![2, 1, 0]);
    }
}
