/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pending results and reply maps.
//!
//! Every ordered call enqueues a pending result before its message is handed to the
//! multicast engine. When the caller's own message is delivered back to it, the
//! runtime knows exactly which ids are in the shard in the view current at delivery
//! time, and fulfills the reply map with those ids; point-to-point calls are
//! fulfilled immediately with their single target. Each arriving reply resolves one
//! entry; a view change resolves the entries of departed members with
//! [`ReplyError::NodeRemovedFromShard`]; tearing down the replicated object resolves
//! every outstanding entry with [`ReplyError::CallerRemoved`]. Once every entry has a
//! value the handle is complete and eligible for collection.
//!
//! The self-receive race — a caller's own ordered message delivered before the
//! caller has enqueued its pending result — is resolved with a condition variable:
//! the delivery thread waits until the queue is non-empty.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use borsh::BorshDeserialize;

use crate::error::{GroupError, ReplyError};
use crate::membership::view::View;
use crate::types::basic::{NodeId, SubgroupId};

/// The reply map of a completed query: one entry per promised member, each a
/// marshalled handler return or a per-entry failure.
#[derive(Clone, Debug)]
pub struct ReplyMap {
    replies: HashMap<NodeId, Result<Vec<u8>, ReplyError>>,
}

impl ReplyMap {
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn get(&self, node: NodeId) -> Option<&Result<Vec<u8>, ReplyError>> {
        self.replies.get(&node)
    }

    /// Deserialize one member's reply.
    pub fn reply_as<T: BorshDeserialize>(&self, node: NodeId) -> Result<T, ReplyError> {
        match self.replies.get(&node) {
            Some(Ok(bytes)) => {
                T::try_from_slice(bytes).map_err(|_| ReplyError::SerializationFailure(node))
            }
            Some(Err(e)) => Err(e.clone()),
            None => Err(ReplyError::NodeRemovedFromShard(node)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Result<Vec<u8>, ReplyError>)> {
        self.replies.iter()
    }
}

struct ResultState {
    /// `None` until fulfillment; then the exact shard membership promised to reply.
    promised: Option<Vec<NodeId>>,
    replies: HashMap<NodeId, Result<Vec<u8>, ReplyError>>,
}

/// One ordered or point-to-point call's pending state.
pub struct PendingResult {
    invocation: u64,
    subgroup: SubgroupId,
    /// Fire-and-forget sends enqueue a pending result too (the self-receive
    /// fulfillment path requires one per ordered call) but expect no replies and
    /// complete upon fulfillment.
    expects_replies: bool,
    state: Mutex<ResultState>,
    completed: Condvar,
}

impl PendingResult {
    fn new(invocation: u64, subgroup: SubgroupId, expects_replies: bool) -> PendingResult {
        PendingResult {
            invocation,
            subgroup,
            expects_replies,
            state: Mutex::new(ResultState {
                promised: None,
                replies: HashMap::new(),
            }),
            completed: Condvar::new(),
        }
    }

    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    pub fn subgroup(&self) -> SubgroupId {
        self.subgroup
    }

    /// Fill in the promised-member set. Called exactly once, at self-receive time
    /// for ordered calls or at send time for point-to-point calls.
    pub fn fulfill(&self, members: Vec<NodeId>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.promised.is_none());
        state.promised = Some(members);
        drop(state);
        self.completed.notify_all();
    }

    pub fn add_reply(&self, from: NodeId, value: Result<Vec<u8>, ReplyError>) {
        let mut state = self.state.lock().unwrap();
        let expected = state
            .promised
            .as_ref()
            .map(|p| p.contains(&from))
            .unwrap_or(false);
        if !expected {
            log::warn!(
                "dropping reply from node {from} not promised by invocation {}",
                self.invocation
            );
            return;
        }
        state.replies.entry(from).or_insert(value);
        drop(state);
        self.completed.notify_all();
    }

    /// Resolve the entry of a member removed from the shard, if it has not replied.
    pub fn set_exception_for_removed_node(&self, node: NodeId) {
        self.add_reply(node, Err(ReplyError::NodeRemovedFromShard(node)));
    }

    /// Resolve every unresolved entry: the replicated object on the calling node has
    /// been torn down.
    pub fn set_exception_for_caller_removed(&self) {
        let mut state = self.state.lock().unwrap();
        let promised = state.promised.get_or_insert_with(Vec::new).clone();
        for node in promised {
            state
                .replies
                .entry(node)
                .or_insert(Err(ReplyError::CallerRemoved));
        }
        // A never-fulfilled call has an empty promise set and completes as such.
        drop(state);
        self.completed.notify_all();
    }

    /// Complete when every promised member has a reply or a removal error.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        match &state.promised {
            Some(promised) => {
                !self.expects_replies || promised.iter().all(|n| state.replies.contains_key(n))
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Option<ReplyMap> {
        let state = self.state.lock().unwrap();
        let promised = state.promised.as_ref()?;
        if self.expects_replies && !promised.iter().all(|n| state.replies.contains_key(n)) {
            return None;
        }
        Some(ReplyMap {
            replies: state.replies.clone(),
        })
    }

    fn wait(&self, shutdown: &AtomicBool) -> Result<ReplyMap, GroupError> {
        let mut state = self.state.lock().unwrap();
        loop {
            let done = match &state.promised {
                Some(promised) => {
                    !self.expects_replies
                        || promised.iter().all(|n| state.replies.contains_key(n))
                }
                None => false,
            };
            if done {
                return Ok(ReplyMap {
                    replies: state.replies.clone(),
                });
            }
            if shutdown.load(Ordering::Relaxed) {
                return Err(GroupError::ShuttingDown);
            }
            let (next, _) = self
                .completed
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap();
            state = next;
        }
    }
}

/// Handle returned to the caller of an ordered or point-to-point query.
pub struct QueryResults {
    pending: Arc<PendingResult>,
    shutdown: Arc<AtomicBool>,
}

impl QueryResults {
    /// Block until every promised member has replied or been marked departed, then
    /// return the reply map.
    pub fn get(&self) -> Result<ReplyMap, GroupError> {
        self.pending.wait(&self.shutdown)
    }

    /// The reply map if it is already complete.
    pub fn try_get(&self) -> Option<ReplyMap> {
        self.pending.snapshot()
    }
}

struct PendingQueues {
    /// Per subgroup: calls sent but not yet self-received, in issue order.
    to_fulfill: HashMap<SubgroupId, VecDeque<Arc<PendingResult>>>,
    /// Per subgroup: fulfilled calls awaiting replies.
    fulfilled: HashMap<SubgroupId, Vec<Arc<PendingResult>>>,
}

/// All pending results on this node. The queue mutex is the `pending_results`
/// lock; the condition variable serializes the self-receive race.
pub struct PendingResults {
    queues: Mutex<PendingQueues>,
    nonempty: Condvar,
    shutdown: Arc<AtomicBool>,
}

impl PendingResults {
    pub fn new(shutdown: Arc<AtomicBool>) -> PendingResults {
        PendingResults {
            queues: Mutex::new(PendingQueues {
                to_fulfill: HashMap::new(),
                fulfilled: HashMap::new(),
            }),
            nonempty: Condvar::new(),
            shutdown,
        }
    }

    /// Open a pending result for a call about to be sent. Must happen before the
    /// send so the self-receive finds it (or waits only for the enqueue race, not
    /// for the send itself).
    pub fn open(
        &self,
        invocation: u64,
        subgroup: SubgroupId,
        expects_replies: bool,
    ) -> QueryResults {
        let pending = Arc::new(PendingResult::new(invocation, subgroup, expects_replies));
        let mut queues = self.queues.lock().unwrap();
        queues
            .to_fulfill
            .entry(subgroup)
            .or_default()
            .push_back(pending.clone());
        drop(queues);
        self.nonempty.notify_all();
        QueryResults {
            pending,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Open and immediately fulfill a point-to-point call's pending result with its
    /// single target.
    pub fn open_p2p(&self, invocation: u64, subgroup: SubgroupId, target: NodeId) -> QueryResults {
        let pending = Arc::new(PendingResult::new(invocation, subgroup, true));
        pending.fulfill(vec![target]);
        let mut queues = self.queues.lock().unwrap();
        queues
            .fulfilled
            .entry(subgroup)
            .or_default()
            .push(pending.clone());
        drop(queues);
        QueryResults {
            pending,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Withdraw a call whose send was refused (wedged or shutting down), so the
    /// self-receive bookkeeping stays aligned with what was actually sent.
    pub fn cancel(&self, subgroup: SubgroupId, invocation: u64) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.to_fulfill.get_mut(&subgroup) {
            queue.retain(|p| p.invocation != invocation);
        }
    }

    /// Self-receive of an ordered call: wait until the caller has enqueued its
    /// pending result, fulfill the reply map with the shard membership of the
    /// current view, and move the handle to the fulfilled list.
    ///
    /// Returns the fulfilled handle, or an error if the expected invocation never
    /// appears (shutdown).
    pub fn fulfill_next(
        &self,
        subgroup: SubgroupId,
        invocation: u64,
        members: &[NodeId],
    ) -> Result<Arc<PendingResult>, GroupError> {
        let mut queues = self.queues.lock().unwrap();
        loop {
            if let Some(queue) = queues.to_fulfill.get_mut(&subgroup) {
                // Ordered self-deliveries arrive in issue order; entries below the
                // delivered invocation belong to calls withdrawn after a refused send.
                queue.retain(|p| p.invocation() >= invocation);
                if let Some(front) = queue.front() {
                    if front.invocation() != invocation {
                        return Err(GroupError::ProtocolViolation(format!(
                            "self-receive of invocation {invocation} found {} at the queue head",
                            front.invocation()
                        )));
                    }
                    let pending = queue.pop_front().unwrap();
                    pending.fulfill(members.to_vec());
                    let fulfilled = queues.fulfilled.entry(subgroup).or_default();
                    fulfilled.push(pending.clone());
                    // Fire-and-forget sends complete on fulfillment; collect them.
                    fulfilled.retain(|p| !p.is_complete());
                    return Ok(pending);
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(GroupError::ShuttingDown);
            }
            let (next, _) = self
                .nonempty
                .wait_timeout(queues, Duration::from_millis(50))
                .unwrap();
            queues = next;
        }
    }

    /// Route an arriving reply to its pending result.
    pub fn route_reply(
        &self,
        subgroup: SubgroupId,
        invocation: u64,
        from: NodeId,
        value: Result<Vec<u8>, ReplyError>,
    ) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(fulfilled) = queues.fulfilled.get_mut(&subgroup) {
            if let Some(pending) = fulfilled.iter().find(|p| p.invocation() == invocation) {
                pending.add_reply(from, value);
            }
            fulfilled.retain(|p| !p.is_complete());
        }
    }

    /// A new view was installed: resolve, for every fulfilled pending result of
    /// every subgroup, the entries of members departed from the corresponding shard.
    pub fn on_view_change(&self, view: &View) {
        let mut queues = self.queues.lock().unwrap();
        for (subgroup, fulfilled) in queues.fulfilled.iter_mut() {
            let departed: Vec<NodeId> = view
                .subgroup_shard_views
                .get(subgroup.index())
                .map(|shards| {
                    shards
                        .iter()
                        .flat_map(|sv| sv.departed.iter().copied())
                        .collect()
                })
                .unwrap_or_default();
            for pending in fulfilled.iter() {
                for node in &departed {
                    pending.set_exception_for_removed_node(*node);
                }
            }
            fulfilled.retain(|p| !p.is_complete());
        }
    }

    /// The replicated object for a subgroup is being torn down on this node: every
    /// still-pending result for it completes with a caller-removed error.
    pub fn destroy_subgroup(&self, subgroup: SubgroupId) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(mut queue) = queues.to_fulfill.remove(&subgroup) {
            for pending in queue.drain(..) {
                pending.set_exception_for_caller_removed();
            }
        }
        if let Some(fulfilled) = queues.fulfilled.remove(&subgroup) {
            for pending in fulfilled {
                pending.set_exception_for_caller_removed();
            }
        }
    }

    /// Complete every outstanding call with a caller-removed error (local shutdown
    /// or voluntary departure).
    pub fn destroy_all(&self) {
        let subgroups: Vec<SubgroupId> = {
            let queues = self.queues.lock().unwrap();
            queues
                .to_fulfill
                .keys()
                .chain(queues.fulfilled.keys())
                .copied()
                .collect()
        };
        for subgroup in subgroups {
            self.destroy_subgroup(subgroup);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::view::{RpcMode, SubView};
    use crate::types::basic::{Endpoints, Vid};

    fn pending_results() -> PendingResults {
        PendingResults::new(Arc::new(AtomicBool::new(false)))
    }

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().map(|i| NodeId::new(*i)).collect()
    }

    #[test]
    fn query_completes_when_all_promised_members_reply() {
        let pending = pending_results();
        let sg = SubgroupId::new(0);
        let results = pending.open(1, sg, true);

        let handle = pending.fulfill_next(sg, 1, &ids(&[10, 11])).unwrap();
        assert!(!handle.is_complete());
        assert!(results.try_get().is_none());

        pending.route_reply(sg, 1, NodeId::new(10), Ok(vec![1]));
        pending.route_reply(sg, 1, NodeId::new(11), Ok(vec![2]));

        let map = results.get().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(NodeId::new(10)), Some(&Ok(vec![1])));
    }

    #[test]
    fn fire_and_forget_sends_complete_on_fulfillment() {
        let pending = pending_results();
        let sg = SubgroupId::new(0);
        let _results = pending.open(5, sg, false);
        let handle = pending.fulfill_next(sg, 5, &ids(&[10, 11])).unwrap();
        assert!(handle.is_complete());
    }

    #[test]
    fn departed_members_resolve_to_removed_node_errors() {
        let pending = pending_results();
        let sg = SubgroupId::new(0);
        let results = pending.open(2, sg, true);
        pending.fulfill_next(sg, 2, &ids(&[10, 11, 12])).unwrap();
        pending.route_reply(sg, 2, NodeId::new(10), Ok(vec![7]));

        // Node 12 departs in the next view.
        let mut view = View::new(
            Vid::new(1),
            ids(&[10, 11]),
            vec![Endpoints::unset(); 2],
            vec![false; 2],
            Vec::new(),
            vec![NodeId::new(12)],
            NodeId::new(10),
            Vec::new(),
        );
        let mut subview = SubView::new(RpcMode::Ordered, ids(&[10, 11]), vec![true, true]);
        subview.departed = vec![NodeId::new(12)];
        view.subgroup_shard_views = vec![vec![subview]];
        pending.on_view_change(&view);

        pending.route_reply(sg, 2, NodeId::new(11), Ok(vec![8]));
        let map = results.get().unwrap();
        assert_eq!(
            map.get(NodeId::new(12)),
            Some(&Err(ReplyError::NodeRemovedFromShard(NodeId::new(12))))
        );
        // Reply-map completeness: every promised member appears exactly once.
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn teardown_resolves_everything_to_caller_removed() {
        let pending = pending_results();
        let sg = SubgroupId::new(0);
        let fulfilled = pending.open(3, sg, true);
        pending.fulfill_next(sg, 3, &ids(&[10, 11])).unwrap();
        let unfulfilled = pending.open(4, sg, true);

        pending.destroy_subgroup(sg);

        let map = fulfilled.get().unwrap();
        assert!(map
            .iter()
            .all(|(_, v)| v == &Err(ReplyError::CallerRemoved)));
        // The unfulfilled call completes with an empty promise set.
        assert!(unfulfilled.get().unwrap().is_empty());
    }

    #[test]
    fn p2p_queries_are_fulfilled_immediately() {
        let pending = pending_results();
        let sg = SubgroupId::new(1);
        let results = pending.open_p2p(9, sg, NodeId::new(42));
        assert!(results.try_get().is_none());
        pending.route_reply(sg, 9, NodeId::new(42), Ok(vec![3]));
        assert_eq!(
            results.get().unwrap().reply_as::<u8>(NodeId::new(42)),
            Ok(3)
        );
    }
}
