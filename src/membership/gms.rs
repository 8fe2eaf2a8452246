/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The group management service: the core thread.
//!
//! The core thread owns the shared state table and everything driven by it. It
//! applies inbound fabric traffic to the table, evaluates the registered predicates
//! after every batch of changes, and runs the fired actions: majority confirmation
//! of suspicions and freezing, leader change proposals, follower acknowledgement,
//! majority commit, wedging, the ragged-edge flush, and finally deterministic
//! computation and installation of the next view. It also hosts the ordered
//! multicast engines, since their counters live in the same table.
//!
//! A suspicion on a single row stays local: the peer is only marked failed (and its
//! row frozen) once a strict majority of live rows suspect it, or once it suspects
//! itself, which is how a member announces its own departure.
//!
//! Ordered sends from application threads, delivery acknowledgements from the
//! delivery thread, and durable-frontier notices from the persistence thread all
//! arrive over the same channel as remote traffic, so the table has a single writer.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use crate::config::Configuration;
use crate::error::GroupError;
use crate::events::{
    Event, EventSink, ProposeChangeEvent, SuspectEvent, ViewInstalledEvent, WedgeEvent,
};
use crate::fabric::{Fabric, FabricMessage, JoinRequest, StateSnapshot, ViewHandoff};
use crate::membership::allocation::{apply_allocation, SubgroupInfo};
use crate::membership::view::View;
use crate::multicast::{PayloadEnvelope, SubgroupMulticast};
use crate::persistence::{PersistedNotice, VersionLog};
use crate::rpc::pending::PendingResults;
use crate::rpc::{ClassDescriptor, Dispatcher, ObjectRegistry, RegisteredObject, ReplicatedObject};
use crate::sst::predicates::{PredicateKind, Predicates};
use crate::sst::{ColumnSet, SharedStateTable, SstRow};
use crate::types::basic::{Endpoints, NodeId, SeqNum, SubgroupId, TypeId, Vid};
use crate::types::hlc::wall_clock_nanos;

/// Everything that can wake the core thread.
pub(crate) enum CoreEvent {
    /// Inbound fabric traffic routed by the poller.
    Remote(NodeId, FabricMessage),
    /// An ordered send from an application thread.
    Invoke(SendRequest),
    /// The delivery thread finished a batch; `delivered_num` may advance.
    Delivered { subgroup: SubgroupId, upto: SeqNum },
    /// The persistence thread made a version durable; `persisted_num` may advance.
    Persisted(PersistedNotice),
    /// The application announced a local suspicion of a peer.
    Suspect(NodeId),
    /// The application announced its own departure.
    Leave,
    Shutdown,
}

impl From<(NodeId, FabricMessage)> for CoreEvent {
    fn from((origin, message): (NodeId, FabricMessage)) -> CoreEvent {
        CoreEvent::Remote(origin, message)
    }
}

impl From<PersistedNotice> for CoreEvent {
    fn from(notice: PersistedNotice) -> CoreEvent {
        CoreEvent::Persisted(notice)
    }
}

/// An ordered send handed to the core thread. The completion channel reports
/// admission: `Ok` once the message has a sequence number, or the error that
/// refused it.
pub(crate) struct SendRequest {
    pub subgroup: SubgroupId,
    pub body: Vec<u8>,
    pub completion: Sender<Result<(), GroupError>>,
}

/// Work shipped to the delivery thread. The channel is FIFO, which is what makes a
/// new view observable to the RPC layer only after every message of the old view
/// that will ever be delivered has been.
pub(crate) enum DeliveryJob {
    Batch {
        subgroup: SubgroupId,
        persistent: bool,
        /// The members of this node's shard in the view current at batch time; the
        /// promised-member set for self-received calls.
        shard_members: Vec<NodeId>,
        messages: Vec<(SeqNum, PayloadEnvelope)>,
    },
    ViewChange(Arc<View>),
    Teardown(SubgroupId),
    Shutdown,
}

/// What the application registered for one replicated type.
pub(crate) struct TypeRegistration {
    pub descriptor: ClassDescriptor,
    pub persistent: bool,
    pub factory: Box<dyn Fn() -> Box<dyn ReplicatedObject> + Send>,
}

/// How this node enters the group: as a founding member with the static initial
/// membership, or by joining through a contact node.
pub(crate) enum Bootstrap {
    Founding(Vec<(NodeId, Endpoints)>),
    Joining {
        contact: NodeId,
        contact_endpoints: Endpoints,
    },
}

/// Action tokens dispatched when a table predicate fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GmsAction {
    Suspicion,
    Acknowledge,
    Propose,
    Commit,
    Wedge,
    GlobalMin,
    RaggedFlush,
    Install,
    Deliver,
}

struct EngineSlot {
    mc: SubgroupMulticast,
    persistent: bool,
    /// Deliveries are held until the shard leader's state snapshot arrives.
    awaiting_snapshot: bool,
}

/// Per-view working state.
struct ActiveState {
    view: View,
    table: SharedStateTable,
    predicates: Predicates<GmsAction>,
    engines: BTreeMap<SubgroupId, EngineSlot>,
    parked: HashMap<SubgroupId, VecDeque<SendRequest>>,
    ragged_targets: HashMap<SubgroupId, SeqNum>,
    last_heard: Vec<Instant>,
    dirty: ColumnSet,
    wedged: bool,
    initial_leader_rank: Option<usize>,
    i_know_i_am_leader: bool,
}

pub(crate) struct GroupCore<F: Fabric> {
    my_id: NodeId,
    config: Configuration,
    fabric: F,
    p2p_connections: Arc<Mutex<F>>,
    info: SubgroupInfo,
    registrations: HashMap<TypeId, TypeRegistration>,
    pending: Arc<PendingResults>,
    dispatcher: Arc<Dispatcher>,
    objects: Arc<ObjectRegistry>,
    versions: VersionLog,
    shared_view: Arc<Mutex<Option<Arc<View>>>>,
    events: EventSink,
    delivery: Sender<DeliveryJob>,

    state: Option<ActiveState>,
    join_contact: Option<NodeId>,
    /// Payload bodies for the next view, buffered until we install it too.
    future_payloads: Vec<PayloadEnvelope>,
    /// Shard-leader snapshots that raced ahead of our install.
    future_snapshots: Vec<StateSnapshot>,
    last_heartbeat: Instant,
    halted: bool,
    leaving: bool,
}

impl<F: Fabric> GroupCore<F> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        my_id: NodeId,
        config: Configuration,
        fabric: F,
        p2p_connections: Arc<Mutex<F>>,
        info: SubgroupInfo,
        registrations: HashMap<TypeId, TypeRegistration>,
        pending: Arc<PendingResults>,
        dispatcher: Arc<Dispatcher>,
        objects: Arc<ObjectRegistry>,
        versions: VersionLog,
        shared_view: Arc<Mutex<Option<Arc<View>>>>,
        events: EventSink,
        delivery: Sender<DeliveryJob>,
    ) -> GroupCore<F> {
        GroupCore {
            my_id,
            config,
            fabric,
            p2p_connections,
            info,
            registrations,
            pending,
            dispatcher,
            objects,
            versions,
            shared_view,
            events,
            delivery,
            state: None,
            join_contact: None,
            future_payloads: Vec::new(),
            future_snapshots: Vec::new(),
            last_heartbeat: Instant::now(),
            halted: false,
            leaving: false,
        }
    }

    /// The core thread's main loop.
    pub(crate) fn run(mut self, inbox: Receiver<CoreEvent>, bootstrap: Bootstrap) {
        match bootstrap {
            Bootstrap::Founding(initial) => {
                let members: Vec<NodeId> = initial.iter().map(|(id, _)| *id).collect();
                let endpoints: Vec<Endpoints> = initial.iter().map(|(_, ep)| *ep).collect();
                self.fabric
                    .install_membership(&initial);
                self.p2p_connections
                    .lock()
                    .unwrap()
                    .install_membership(&initial);
                let mut view = View::new(
                    Vid::init(),
                    members.clone(),
                    endpoints,
                    vec![false; members.len()],
                    members,
                    Vec::new(),
                    self.my_id,
                    self.info.type_order(),
                );
                if let Err(e) = apply_allocation(&mut view, &self.info, None) {
                    log::warn!("initial view is inadequate: {e}");
                }
                self.establish_view(view, None, &HashMap::new());
            }
            Bootstrap::Joining {
                contact,
                contact_endpoints,
            } => {
                self.join_contact = Some(contact);
                self.fabric
                    .install_membership(&[(contact, contact_endpoints)]);
                self.fabric.send(
                    contact,
                    FabricMessage::Join(JoinRequest {
                        joiner_id: self.my_id,
                        joiner_endpoints: Endpoints::new(
                            self.config.identity.local_ip,
                            self.config.identity.gms_port,
                            self.config.identity.rdma_port,
                            self.config.identity.rpc_port,
                            self.config.identity.sst_port,
                        ),
                    }),
                );
            }
        }

        loop {
            match inbox.recv_timeout(self.config.membership.heartbeat_interval) {
                Ok(CoreEvent::Shutdown) => break,
                Ok(event) => {
                    self.handle_event(event);
                    // Drain the burst before evaluating predicates.
                    loop {
                        match inbox.try_recv() {
                            Ok(CoreEvent::Shutdown) => return self.shutdown(),
                            Ok(event) => self.handle_event(event),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => return self.shutdown(),
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.halted {
                continue;
            }
            self.heartbeat_if_due();
            self.run_predicates();
            self.flush_dirty();
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(state) = &mut self.state {
            for (_, mut queue) in state.parked.drain() {
                for request in queue.drain(..) {
                    let _ = request.completion.send(Err(GroupError::ShuttingDown));
                }
            }
        }
        let _ = self.delivery.send(DeliveryJob::Shutdown);
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: CoreEvent) {
        if self.halted {
            return;
        }
        match event {
            CoreEvent::Remote(origin, message) => self.handle_remote(origin, message),
            CoreEvent::Invoke(request) => self.handle_send(request),
            CoreEvent::Delivered { subgroup, upto } => self.handle_delivered(subgroup, upto),
            CoreEvent::Persisted(notice) => self.handle_persisted(notice),
            CoreEvent::Suspect(peer) => self.note_suspicion(peer),
            CoreEvent::Leave => self.handle_leave(),
            CoreEvent::Shutdown => {}
        }
    }

    fn handle_remote(&mut self, origin: NodeId, message: FabricMessage) {
        match message {
            FabricMessage::SstPatch(patch) => {
                let state = match &mut self.state {
                    Some(state) => state,
                    None => return,
                };
                match state.table.apply_patch(&patch) {
                    Ok(applied) => {
                        if applied {
                            if let Some(rank) = state.table.rank_of(origin) {
                                state.last_heard[rank] = Instant::now();
                            }
                        }
                    }
                    Err(e) => self.halt(e),
                }
            }
            FabricMessage::Payload(envelope) => self.handle_payload(origin, envelope),
            FabricMessage::Join(request) => self.handle_join(request),
            FabricMessage::Handoff(handoff) => self.handle_handoff(handoff),
            FabricMessage::Snapshot(snapshot) => self.handle_snapshot(snapshot),
            FabricMessage::PeerUnreachable(peer) => self.note_suspicion(peer),
            FabricMessage::P2p(_) => {
                // P2P traffic is routed to the receive thread by the poller.
            }
        }
    }

    fn handle_payload(&mut self, origin: NodeId, envelope: PayloadEnvelope) {
        let state = match &mut self.state {
            Some(state) => state,
            None => {
                // Still joining: hold bodies for the view the handoff will bring.
                self.future_payloads.push(envelope);
                return;
            }
        };
        let current = state.table.vid();
        if envelope.vid == current {
            if let Some(rank) = state.table.rank_of(origin) {
                state.last_heard[rank] = Instant::now();
            }
            if let Some(slot) = state.engines.get_mut(&envelope.subgroup) {
                state.dirty =
                    state.dirty | slot.mc.receive(envelope, state.table.local_row_mut());
            }
        } else if envelope.vid > current {
            self.future_payloads.push(envelope);
        }
    }

    fn handle_join(&mut self, request: JoinRequest) {
        let (i_am_leader, leader, already_known) = {
            let state = match &self.state {
                Some(state) => state,
                None => return,
            };
            (
                state.view.i_am_leader(),
                state
                    .view
                    .rank_of_leader()
                    .map(|rank| state.view.members[rank]),
                state.view.rank_of(request.joiner_id).is_some()
                    || change_pending(state, request.joiner_id),
            )
        };
        if !i_am_leader {
            // Redirect to the current leader.
            if let Some(leader) = leader {
                if leader != self.my_id {
                    self.fabric.send(leader, FabricMessage::Join(request));
                }
            }
            return;
        }
        if already_known {
            return;
        }
        log::info!("leader proposing join of node {}", request.joiner_id);
        self.append_change(request.joiner_id, Some(request.joiner_endpoints));
    }

    fn handle_handoff(&mut self, handoff: ViewHandoff) {
        if self.state.is_some() {
            return;
        }
        let mut view = View::from_wire(handoff.view, self.my_id);
        // Re-run the allocation functions to recover the fields the wire form does
        // not carry; the layout is deterministic so the result matches the wire's.
        if view.adequate {
            let _ = apply_allocation(&mut view, &self.info, None);
        }
        let snapshots: HashMap<SubgroupId, Vec<u8>> = handoff.snapshots.into_iter().collect();
        let num_installed = handoff.num_installed;
        log::info!("joining in view {} after state transfer", view.vid);
        self.establish_view(view, None, &snapshots);
        if let Some(state) = &mut self.state {
            let row = state.table.local_row_mut();
            row.num_changes = num_installed;
            row.num_committed = num_installed;
            row.num_acked = num_installed;
            row.num_installed = num_installed;
            state.dirty = state.dirty
                | ColumnSet::NUM_CHANGES
                | ColumnSet::NUM_COMMITTED
                | ColumnSet::NUM_ACKED
                | ColumnSet::NUM_INSTALLED;
        }
    }

    /// State arriving from the shard leader for a shard this node just entered.
    /// Applied only while the subgroup is still holding deliveries for it;
    /// duplicates and late snapshots are dropped.
    fn handle_snapshot(&mut self, snapshot: StateSnapshot) {
        let state = match &mut self.state {
            Some(state) => state,
            None => {
                self.future_snapshots.push(snapshot);
                return;
            }
        };
        let current = state.table.vid();
        if snapshot.vid > current {
            self.future_snapshots.push(snapshot);
            return;
        }
        if snapshot.vid < current {
            return;
        }
        let slot = match state.engines.get_mut(&snapshot.subgroup) {
            Some(slot) if slot.awaiting_snapshot => slot,
            _ => return,
        };
        slot.awaiting_snapshot = false;
        let mut objects = self.objects.objects.lock().unwrap();
        if let Some(registered) = objects.get_mut(&snapshot.subgroup) {
            if let Err(e) = registered.object.restore_state(&snapshot.state) {
                log::error!(
                    "failed to restore transferred state of {}: {e}",
                    snapshot.subgroup
                );
            } else {
                log::info!("restored transferred state of subgroup {}", snapshot.subgroup);
            }
        }
    }

    fn handle_send(&mut self, request: SendRequest) {
        if self.leaving || self.halted {
            let _ = request.completion.send(Err(GroupError::ShuttingDown));
            return;
        }
        let state = match &mut self.state {
            Some(state) => state,
            None => {
                let _ = request.completion.send(Err(GroupError::InadequateView));
                return;
            }
        };
        if !state.view.adequate {
            let _ = request.completion.send(Err(GroupError::InadequateView));
            return;
        }
        if !state.engines.contains_key(&request.subgroup) {
            let _ = request.completion.send(Err(GroupError::InvalidSubgroup {
                subgroup: request.subgroup,
                is_member: false,
            }));
            return;
        }
        if state.wedged {
            let _ = request.completion.send(Err(GroupError::GroupWedged));
            return;
        }
        let queue_nonempty = state
            .parked
            .get(&request.subgroup)
            .map(|q| !q.is_empty())
            .unwrap_or(false);
        let slot = state.engines.get_mut(&request.subgroup).unwrap();
        // Park behind earlier parked sends even when the window has room: the
        // pending-result queue order must match the multicast issue order.
        if queue_nonempty || slot.mc.window_full(state.table.local_row()) {
            state
                .parked
                .entry(request.subgroup)
                .or_default()
                .push_back(request);
            return;
        }
        Self::accept_send(&mut self.fabric, self.my_id, state, request);
    }

    fn accept_send(fabric: &mut F, my_id: NodeId, state: &mut ActiveState, request: SendRequest) {
        let vid = state.table.vid();
        let slot = state.engines.get_mut(&request.subgroup).unwrap();
        let envelope = match slot.mc.next_envelope(vid, my_id, request.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = request.completion.send(Err(e));
                return;
            }
        };
        let peers = slot.mc.peers(my_id);
        fabric.multicast(&peers, FabricMessage::Payload(envelope.clone()));
        state.dirty = state.dirty | slot.mc.receive(envelope, state.table.local_row_mut());
        let _ = request.completion.send(Ok(()));
    }

    fn handle_delivered(&mut self, subgroup: SubgroupId, upto: SeqNum) {
        let state = match &mut self.state {
            Some(state) => state,
            None => return,
        };
        let row = state.table.local_row_mut();
        if let Some(cell) = row.delivered_num.get_mut(subgroup.index()) {
            if upto > *cell {
                *cell = upto;
                state.dirty = state.dirty | ColumnSet::DELIVERED_NUM;
            }
        }
        // The window may have opened: admit parked sends in arrival order.
        loop {
            let ready = {
                let slot = match state.engines.get(&subgroup) {
                    Some(slot) => slot,
                    None => break,
                };
                let queue_nonempty = state
                    .parked
                    .get(&subgroup)
                    .map(|q| !q.is_empty())
                    .unwrap_or(false);
                queue_nonempty && !state.wedged && !slot.mc.window_full(state.table.local_row())
            };
            if !ready {
                break;
            }
            let request = state.parked.get_mut(&subgroup).unwrap().pop_front().unwrap();
            Self::accept_send(&mut self.fabric, self.my_id, state, request);
        }
    }

    fn handle_persisted(&mut self, notice: PersistedNotice) {
        let state = match &mut self.state {
            Some(state) => state,
            None => return,
        };
        let row = state.table.local_row_mut();
        let delivered = row.delivered_num.get(notice.subgroup.index()).copied();
        if let (Some(cell), Some(delivered)) = (
            row.persisted_num.get_mut(notice.subgroup.index()),
            delivered,
        ) {
            // A notice carrying an old view's encoding would outrun the fresh
            // counters; the durable frontier never passes the delivery frontier.
            if notice.seq > *cell && notice.seq <= delivered {
                *cell = notice.seq;
                state.dirty = state.dirty | ColumnSet::PERSISTED_NUM;
            }
        }
        self.events.emit(Event::Persisted(crate::events::PersistedEvent {
            timestamp: SystemTime::now(),
            subgroup: notice.subgroup,
            version: notice.version,
        }));
    }

    /// Record a local suspicion of a peer in the local row. Confirmation (freezing,
    /// failure marking, wedging, proposals) happens in the suspicion action once the
    /// predicate fires.
    fn note_suspicion(&mut self, peer: NodeId) {
        let state = match &mut self.state {
            Some(state) => state,
            None => return,
        };
        if let Some(rank) = state.view.rank_of(peer) {
            if !state.view.failed[rank] && !state.table.local_row().suspected[rank] {
                log::warn!("suspecting node {peer}");
                state.table.local_row_mut().suspected[rank] = true;
                state.dirty = state.dirty | ColumnSet::SUSPECTED;
            }
        }
    }

    fn handle_leave(&mut self) {
        if self.leaving {
            return;
        }
        self.leaving = true;
        log::info!("announcing departure of node {}", self.my_id);
        if let Some(state) = &mut self.state {
            if let Some(my_rank) = state.view.my_rank {
                state.table.local_row_mut().suspected[my_rank] = true;
                state.dirty = state.dirty | ColumnSet::SUSPECTED;
            }
        }
        self.flush_dirty();
        // Every outstanding call on this node resolves as caller-removed.
        self.pending.destroy_all();
    }

    // ------------------------------------------------------------------
    // Periodic duties
    // ------------------------------------------------------------------

    fn heartbeat_if_due(&mut self) {
        if self.last_heartbeat.elapsed() < self.config.membership.heartbeat_interval {
            return;
        }
        self.last_heartbeat = Instant::now();
        let timeout = self.config.membership.suspicion_timeout;
        let mut stale: Vec<NodeId> = Vec::new();
        if let Some(state) = &mut self.state {
            let now = wall_clock_nanos();
            for frontier in state
                .table
                .local_row_mut()
                .local_stability_frontier
                .iter_mut()
            {
                *frontier = now;
            }
            state.dirty = state.dirty | ColumnSet::FRONTIER;

            let my_rank = state.table.my_rank();
            for rank in 0..state.table.num_rows() {
                if rank == my_rank || state.table.is_frozen(rank) || state.view.failed[rank] {
                    continue;
                }
                if state.last_heard[rank].elapsed() > timeout {
                    stale.push(state.view.members[rank]);
                }
            }
            // Republish the full row: cheap repair for peers that dropped patches
            // around a view boundary.
            state.dirty = ColumnSet::all();
        }
        for peer in stale {
            self.note_suspicion(peer);
        }
    }

    // ------------------------------------------------------------------
    // Predicates and actions
    // ------------------------------------------------------------------

    fn register_predicates(predicates: &mut Predicates<GmsAction>) {
        predicates.register(
            "suspicions_pending",
            PredicateKind::Recurrent,
            Box::new(|t| {
                t.live_ranks()
                    .any(|r| t.row(r).suspected.iter().any(|s| *s))
            }),
            GmsAction::Suspicion,
        );
        predicates.register(
            "changes_to_acknowledge",
            PredicateKind::Recurrent,
            Box::new(|t| match lowest_live(t) {
                Some(leader) => {
                    t.row(leader).num_changes > t.local_row().num_acked
                        || t.row(leader).num_committed > t.local_row().num_committed
                }
                None => false,
            }),
            GmsAction::Acknowledge,
        );
        predicates.register(
            "departures_to_propose",
            PredicateKind::Recurrent,
            Box::new(|t| t.live_ranks().any(|r| t.row(r).suspected.iter().any(|s| *s))),
            GmsAction::Propose,
        );
        predicates.register(
            "changes_to_commit",
            PredicateKind::Recurrent,
            Box::new(|t| lowest_live(t) == Some(t.my_rank())),
            GmsAction::Commit,
        );
        predicates.register(
            "commit_outruns_install",
            PredicateKind::Recurrent,
            Box::new(|t| {
                t.live_ranks().any(|r| {
                    t.row(r).num_committed > t.local_row().num_installed || t.row(r).wedged
                })
            }),
            GmsAction::Wedge,
        );
        predicates.register(
            "shard_cutoffs_wanted",
            PredicateKind::Recurrent,
            Box::new(|t| t.local_row().wedged),
            GmsAction::GlobalMin,
        );
        predicates.register(
            "ragged_edge_ready",
            PredicateKind::Recurrent,
            Box::new(|t| t.local_row().wedged),
            GmsAction::RaggedFlush,
        );
        predicates.register(
            "view_installable",
            PredicateKind::Recurrent,
            Box::new(|t| t.local_row().wedged),
            GmsAction::Install,
        );
        predicates.register(
            "stable_messages",
            PredicateKind::Recurrent,
            Box::new(|_| true),
            GmsAction::Deliver,
        );
    }

    fn run_predicates(&mut self) {
        if self.state.is_none() {
            return;
        }
        let fired = {
            let state = self.state.as_mut().unwrap();
            state.predicates.evaluate(&state.table)
        };
        for action in fired {
            if self.halted {
                return;
            }
            match action {
                GmsAction::Suspicion => self.act_on_suspicions(),
                GmsAction::Acknowledge => self.act_acknowledge(),
                GmsAction::Propose => self.act_propose(),
                GmsAction::Commit => self.act_commit(),
                GmsAction::Wedge => self.wedge(),
                GmsAction::GlobalMin => self.act_global_min(),
                GmsAction::RaggedFlush => self.act_ragged_flush(),
                GmsAction::Install => self.act_install(),
                GmsAction::Deliver => self.act_deliver(),
            }
        }
    }

    /// Confirm failures from the suspicion matrix: a member is failed once a strict
    /// majority of live rows suspect it, or once it suspects itself (an announced
    /// departure). Confirmation marks the peer failed, freezes its row, propagates
    /// the suspicion through the local row, and wedges. A suspicion on fewer rows
    /// stays local: the peer keeps its row and no global failure is raised.
    fn act_on_suspicions(&mut self) {
        let mut confirmed: Vec<usize> = Vec::new();
        {
            let state = self.state.as_mut().unwrap();
            let live: Vec<usize> = state.table.live_ranks().collect();
            let quorum = live.len() / 2 + 1;
            let num_rows = state.table.num_rows();
            for subject in 0..num_rows {
                if state.view.failed[subject] {
                    continue;
                }
                let suspicions = live
                    .iter()
                    .filter(|r| state.table.row(**r).suspected[subject])
                    .count();
                let self_suspected = state.table.row(subject).suspected[subject];
                if suspicions >= quorum || self_suspected {
                    confirmed.push(subject);
                }
            }
            for subject in confirmed.iter().copied() {
                let peer = state.view.members[subject];
                log::warn!("node {peer} confirmed suspected; freezing its row");
                state.view.failed[subject] = true;
                state.table.freeze(subject);
                if !state.table.local_row().suspected[subject] {
                    state.table.local_row_mut().suspected[subject] = true;
                }
                state.dirty = state.dirty | ColumnSet::SUSPECTED;
            }
        }
        if confirmed.is_empty() {
            return;
        }
        for subject in confirmed.iter().copied() {
            let peer = {
                let state = self.state.as_ref().unwrap();
                state.view.members[subject]
            };
            self.events.emit(Event::Suspect(SuspectEvent {
                timestamp: SystemTime::now(),
                suspect: peer,
            }));
        }
        // More than half the view failing is an unrecoverable partition risk.
        {
            let state = self.state.as_ref().unwrap();
            if state.view.num_failed() * 2 > state.view.num_members() {
                self.halt(GroupError::ProtocolViolation(String::from(
                    "more than half of the view's members have failed",
                )));
                return;
            }
        }
        self.wedge();
        self.maybe_become_leader();
    }

    /// The new-leader test: every member below this node's rank is failed, and every
    /// row below this node's rank agrees (no lower row still trusts a lower member).
    fn maybe_become_leader(&mut self) {
        let state = self.state.as_mut().unwrap();
        let my_rank = match state.view.my_rank {
            Some(rank) => rank,
            None => return,
        };
        if state.initial_leader_rank == state.view.rank_of_leader()
            || !state.view.i_am_leader()
            || state.i_know_i_am_leader
        {
            return;
        }
        for member in 0..my_rank {
            for row in 0..my_rank {
                if state.table.is_frozen(row) {
                    continue;
                }
                if !state.view.failed[member] && !state.table.row(row).suspected[member] {
                    return;
                }
            }
        }
        state.i_know_i_am_leader = true;
        log::info!("assuming group leadership at rank {my_rank}");
        // Merge the longest proposal list visible before proposing as the leader.
        let mut best: Option<usize> = None;
        for rank in state.table.live_ranks() {
            let better = match best {
                Some(b) => state.table.row(rank).num_changes > state.table.row(b).num_changes,
                None => true,
            };
            if better {
                best = Some(rank);
            }
        }
        if let Some(source) = best {
            if source != state.table.my_rank()
                && state.table.row(source).num_changes > state.table.local_row().num_changes
            {
                let (changes, joiners, num_changes) = {
                    let row = state.table.row(source);
                    (
                        row.changes.clone(),
                        row.joiner_endpoints.clone(),
                        row.num_changes,
                    )
                };
                let row = state.table.local_row_mut();
                row.changes = changes;
                row.joiner_endpoints = joiners;
                row.num_changes = num_changes;
                row.num_acked = num_changes;
                state.dirty = state.dirty
                    | ColumnSet::CHANGES
                    | ColumnSet::JOINER_ENDPOINTS
                    | ColumnSet::NUM_CHANGES
                    | ColumnSet::NUM_ACKED;
            }
        }
        let committed = state
            .table
            .live_ranks()
            .map(|r| state.table.row(r).num_committed)
            .max()
            .unwrap_or(0);
        if committed > state.table.local_row().num_committed {
            state.table.local_row_mut().num_committed = committed;
            state.dirty = state.dirty | ColumnSet::NUM_COMMITTED;
        }
    }

    /// Leader: propose the departure of every non-failed-out member a majority of
    /// live rows suspect, and of every member that suspects itself (voluntary
    /// departure).
    fn act_propose(&mut self) {
        // A successor leader keeps re-testing the takeover condition until the
        // suspicions it needs have propagated to every lower row.
        self.maybe_become_leader();
        let proposals: Vec<NodeId> = {
            let state = self.state.as_ref().unwrap();
            if !state.view.i_am_leader() {
                return;
            }
            if state.initial_leader_rank != state.view.rank_of_leader()
                && !state.i_know_i_am_leader
            {
                // Leadership not yet verified against the lower rows.
                return;
            }
            let live: Vec<usize> = state.table.live_ranks().collect();
            let quorum = live.len() / 2 + 1;
            (0..state.view.num_members())
                .filter(|subject| {
                    let suspicions = live
                        .iter()
                        .filter(|r| state.table.row(**r).suspected[*subject])
                        .count();
                    let self_suspected = state.table.row(*subject).suspected[*subject];
                    (suspicions >= quorum || self_suspected)
                        && !change_pending(state, state.view.members[*subject])
                })
                .map(|subject| state.view.members[subject])
                .collect()
        };
        for node in proposals {
            log::info!("leader proposing departure of node {node}");
            self.append_change(node, None);
        }
    }

    /// Append a membership delta to the local (leader) row's change ring and
    /// acknowledge it. A join carries the joiner's addressing record.
    fn append_change(&mut self, node: NodeId, join: Option<Endpoints>) {
        let state = self.state.as_mut().unwrap();
        let position = state.table.local_row().num_changes;
        let slot = state.table.change_slot(position);
        let is_join = join.is_some();
        {
            let row = state.table.local_row_mut();
            row.changes[slot] = node;
            row.joiner_endpoints[slot] = join.unwrap_or_else(Endpoints::unset);
            row.num_changes = position + 1;
            row.num_acked = row.num_changes;
        }
        state.dirty = state.dirty
            | ColumnSet::CHANGES
            | ColumnSet::JOINER_ENDPOINTS
            | ColumnSet::NUM_CHANGES
            | ColumnSet::NUM_ACKED;
        self.events
            .emit(Event::ProposeChange(ProposeChangeEvent {
                timestamp: SystemTime::now(),
                node,
                is_join,
                num_changes: position + 1,
            }));
    }

    /// Follower: copy the leader's proposals and acknowledge them.
    fn act_acknowledge(&mut self) {
        let state = self.state.as_mut().unwrap();
        let leader = match lowest_live(&state.table) {
            Some(leader) => leader,
            None => return,
        };
        if leader == state.table.my_rank() {
            return;
        }
        let (changes, joiners, num_changes, leader_committed) = {
            let row = state.table.row(leader);
            (
                row.changes.clone(),
                row.joiner_endpoints.clone(),
                row.num_changes,
                row.num_committed,
            )
        };
        let row = state.table.local_row_mut();
        let mut changed = ColumnSet::empty();
        if num_changes > row.num_acked {
            row.changes = changes;
            row.joiner_endpoints = joiners;
            row.num_changes = num_changes;
            // A follower never acknowledges beyond what it has copied.
            row.num_acked = num_changes;
            changed = changed
                | ColumnSet::CHANGES
                | ColumnSet::JOINER_ENDPOINTS
                | ColumnSet::NUM_CHANGES
                | ColumnSet::NUM_ACKED;
        }
        // The commit point is adopted from the leader even when no new proposals
        // arrived with it.
        if leader_committed > row.num_committed {
            row.num_committed = leader_committed;
            changed = changed | ColumnSet::NUM_COMMITTED;
        }
        debug_assert!(row.num_acked <= row.num_changes);
        state.dirty = state.dirty | changed;
    }

    /// Leader: advance the commit point while a strict majority of the current
    /// non-failed members have acknowledged past it. The quorum is counted against
    /// the view's membership, not the table's frozen-row set, so a frozen row can
    /// never shrink the denominator on its own.
    fn act_commit(&mut self) {
        let state = self.state.as_mut().unwrap();
        if lowest_live(&state.table) != Some(state.table.my_rank()) {
            return;
        }
        let non_failed: Vec<usize> = (0..state.view.num_members())
            .filter(|rank| !state.view.failed[*rank])
            .collect();
        let mut advanced = false;
        loop {
            let next = state.table.local_row().num_committed + 1;
            if next > state.table.local_row().num_changes {
                break;
            }
            let acks = non_failed
                .iter()
                .filter(|r| state.table.row(**r).num_acked >= next)
                .count();
            if acks * 2 > non_failed.len() {
                state.table.local_row_mut().num_committed = next;
                advanced = true;
            } else {
                break;
            }
        }
        if advanced {
            state.dirty = state.dirty | ColumnSet::NUM_COMMITTED;
        }
    }

    /// Stop sending in the current view: refuse new sends, fail parked ones, and
    /// publish the wedged flag.
    fn wedge(&mut self) {
        let state = self.state.as_mut().unwrap();
        if state.wedged {
            return;
        }
        state.wedged = true;
        for slot in state.engines.values_mut() {
            slot.mc.wedge();
        }
        for (_, mut queue) in state.parked.drain() {
            for request in queue.drain(..) {
                let _ = request.completion.send(Err(GroupError::GroupWedged));
            }
        }
        state.table.local_row_mut().wedged = true;
        state.dirty = state.dirty | ColumnSet::WEDGED;
        let vid = state.table.vid();
        log::info!("wedged for the transition out of view {vid}");
        self.events.emit(Event::Wedge(WedgeEvent {
            timestamp: SystemTime::now(),
            vid,
        }));
    }

    /// Shard leaders: once every live member is wedged, publish the per-sender
    /// cutoffs for each led subgroup.
    fn act_global_min(&mut self) {
        let state = self.state.as_mut().unwrap();
        if !all_live_wedged(&state.table) {
            return;
        }
        let mut changed = false;
        for (subgroup, slot) in state.engines.iter() {
            if state.table.local_row().global_min_ready[subgroup.index()] {
                continue;
            }
            let leader = slot
                .mc
                .subview()
                .members
                .iter()
                .find(|m| {
                    state
                        .view
                        .rank_of(**m)
                        .map(|r| !state.view.failed[r])
                        .unwrap_or(false)
                })
                .copied();
            if leader != Some(self.my_id) {
                continue;
            }
            let cutoffs = slot.mc.compute_global_min(&state.table);
            let offset = state.view.num_received_offset(*subgroup);
            let row = state.table.local_row_mut();
            row.global_min[offset..offset + cutoffs.len()].copy_from_slice(&cutoffs);
            row.global_min_ready[subgroup.index()] = true;
            changed = true;
        }
        if changed {
            state.dirty = state.dirty | ColumnSet::GLOBAL_MIN | ColumnSet::GLOBAL_MIN_READY;
        }
    }

    /// Followers: once a shard leader has published cutoffs, deliver exactly up to
    /// them and discard the unstable remainder.
    fn act_ragged_flush(&mut self) {
        let state = self.state.as_mut().unwrap();
        let subgroups: Vec<SubgroupId> = state.engines.keys().copied().collect();
        for subgroup in subgroups {
            let slot = state.engines.get_mut(&subgroup).unwrap();
            if slot.mc.is_flushed() {
                continue;
            }
            let leader_rank = slot
                .mc
                .subview()
                .members
                .iter()
                .filter_map(|m| state.view.rank_of(*m))
                .find(|r| !state.view.failed[*r]);
            let leader_rank = match leader_rank {
                Some(rank) => rank,
                None => continue,
            };
            let leader_row = state.table.row(leader_rank);
            if !leader_row.global_min_ready[subgroup.index()] {
                continue;
            }
            let offset = state.view.num_received_offset(subgroup);
            let num_senders = slot.mc.num_senders() as usize;
            let cutoffs: Vec<i32> =
                leader_row.global_min[offset..offset + num_senders].to_vec();
            let batch = slot.mc.flush_ragged_edge(&cutoffs);
            let target = slot.mc.ragged_edge_seq(&cutoffs);
            state.ragged_targets.insert(subgroup, target);
            log::debug!(
                "flushing ragged edge of subgroup {subgroup} up to seq {target}"
            );
            if !batch.is_empty() {
                let _ = self.delivery.send(DeliveryJob::Batch {
                    subgroup,
                    persistent: slot.persistent,
                    shard_members: slot.mc.subview().members.clone(),
                    messages: batch,
                });
            }
        }
    }

    /// Once the old view is fully flushed, apply the committed changes in order and
    /// switch to the next view.
    fn act_install(&mut self) {
        {
            let state = self.state.as_ref().unwrap();
            if !state.wedged || !all_live_wedged(&state.table) {
                return;
            }
            let row = state.table.local_row();
            if row.num_committed <= row.num_installed || row.num_acked < row.num_committed {
                return;
            }
            // Every subgroup of ours must have flushed its ragged edge and seen the
            // flush delivered.
            for (subgroup, slot) in state.engines.iter() {
                if !slot.mc.is_flushed() {
                    return;
                }
                let target = state
                    .ragged_targets
                    .get(subgroup)
                    .copied()
                    .unwrap_or(SeqNum::init());
                if row.delivered_num[subgroup.index()] < target {
                    return;
                }
            }
        }

        // Apply changes [num_installed, num_committed) from the local row.
        let state = self.state.as_mut().unwrap();
        let row = state.table.local_row().clone();
        let mut members: Vec<NodeId> = state.view.members.clone();
        let mut endpoints: Vec<Endpoints> = state.view.endpoints.clone();
        let mut failed: Vec<bool> = state.view.failed.clone();
        let mut joined = Vec::new();
        let mut departed = Vec::new();
        let installed_now = row.num_committed - row.num_installed;
        for position in row.num_installed..row.num_committed {
            let slot = state.table.change_slot(position);
            let node = row.changes[slot];
            if let Some(rank) = members.iter().position(|m| *m == node) {
                members.remove(rank);
                endpoints.remove(rank);
                failed.remove(rank);
                departed.push(node);
            } else if row.joiner_endpoints[slot] != Endpoints::unset() {
                members.push(node);
                endpoints.push(row.joiner_endpoints[slot]);
                failed.push(false);
                joined.push(node);
            } else {
                // A departure committed twice for the same node; nothing to apply.
                log::warn!("skipping duplicate departure of node {node}");
            }
        }

        let vid = state.table.vid().next();
        log::info!(
            "installing view {vid}: members {:?}, joined {:?}, departed {:?}",
            members.iter().map(|m| m.int()).collect::<Vec<_>>(),
            joined.iter().map(|m| m.int()).collect::<Vec<_>>(),
            departed.iter().map(|m| m.int()).collect::<Vec<_>>(),
        );

        let mut view = View::new(
            vid,
            members,
            endpoints,
            failed,
            joined,
            departed,
            self.my_id,
            self.info.type_order(),
        );
        let previous_view = state.view.clone();
        if let Err(e) = apply_allocation(&mut view, &self.info, Some(&previous_view)) {
            log::warn!("view {vid} is inadequate: {e}");
        }
        if let Err(e) = view.validate() {
            self.halt(e);
            return;
        }
        self.establish_view(view, Some((row, installed_now)), &HashMap::new());
        if self.halted {
            return;
        }
        self.send_handoffs();
    }

    /// Stability recomputation and in-order dispatch of stable messages to the
    /// delivery thread.
    fn act_deliver(&mut self) {
        let state = self.state.as_mut().unwrap();
        let subgroups: Vec<SubgroupId> = state.engines.keys().copied().collect();
        for subgroup in subgroups {
            let slot = state.engines.get_mut(&subgroup).unwrap();
            if slot.mc.is_flushed() || slot.awaiting_snapshot {
                continue;
            }
            let changed = slot.mc.update_stability(&mut state.table);
            state.dirty = state.dirty | changed;
            if slot.persistent && changed.contains(ColumnSet::STABLE_NUM) {
                self.versions.advance_stable(
                    subgroup,
                    state.table.vid(),
                    state.table.local_row().stable_num[subgroup.index()],
                );
            }
            let batch = slot.mc.take_deliverable(state.table.local_row());
            if !batch.is_empty() {
                let _ = self.delivery.send(DeliveryJob::Batch {
                    subgroup,
                    persistent: slot.persistent,
                    shard_members: slot.mc.subview().members.clone(),
                    messages: batch,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // View installation
    // ------------------------------------------------------------------

    /// Switch to a view: build the fresh table, engines and predicates, reconcile
    /// the hosted objects, swap the shared view pointer, reopen the point-to-point
    /// connections, and republish the local row.
    fn establish_view(
        &mut self,
        view: View,
        previous_row: Option<(SstRow, i32)>,
        snapshots: &HashMap<SubgroupId, Vec<u8>>,
    ) {
        let sizes = view.table_sizes();
        let my_rank = match view.my_rank {
            Some(rank) => rank,
            None => {
                if self.leaving {
                    // The departure we announced has been installed; this node's
                    // participation ends here.
                    log::info!("departure installed in view {}; stopping", view.vid);
                    self.halted = true;
                } else {
                    self.halt(GroupError::ProtocolViolation(String::from(
                        "installed a view that does not contain this node",
                    )));
                }
                return;
            }
        };
        let mut table = SharedStateTable::new(view.vid, view.members.clone(), my_rank, sizes);
        if let Some((old_row, installed_now)) = &previous_row {
            table.init_local_row_from_previous(old_row, *installed_now);
        }
        // Freeze the rows of members carried into the view already failed, and
        // keep suspecting them in the fresh table: every member that installed
        // this view publishes the same flags, so the majority re-forms and the
        // leader re-proposes any departure that missed the last commit.
        for (rank, is_failed) in view.failed.iter().enumerate() {
            if *is_failed {
                table.freeze(rank);
                table.local_row_mut().suspected[rank] = true;
            }
        }

        let mut predicates = Predicates::new();
        Self::register_predicates(&mut predicates);

        let mut engines = BTreeMap::new();
        let mut type_of_subgroup = HashMap::new();
        for (type_id, subgroup_ids) in &view.subgroup_ids_by_type {
            for subgroup in subgroup_ids {
                type_of_subgroup.insert(*subgroup, *type_id);
            }
        }
        if view.adequate {
            for (subgroup, _) in view.my_subgroups.iter() {
                let subview = view.my_subview(*subgroup).unwrap().clone();
                let persistent = type_of_subgroup
                    .get(subgroup)
                    .and_then(|t| self.registrations.get(t))
                    .map(|r| r.persistent && self.config.persistence.enabled)
                    .unwrap_or(false);
                // A node entering a shard that already carries state must wait for
                // the shard leader's snapshot before delivering anything.
                let awaiting_snapshot = subview.joined.contains(&self.my_id)
                    && subview.members.len() > subview.joined.len()
                    && !snapshots.contains_key(subgroup);
                engines.insert(
                    *subgroup,
                    EngineSlot {
                        mc: SubgroupMulticast::new(
                            *subgroup,
                            subview,
                            self.my_id,
                            view.num_received_offset(*subgroup),
                            self.config.multicast.window_size,
                        ),
                        persistent,
                        awaiting_snapshot,
                    },
                );
            }
            self.reconcile_objects(&view, &type_of_subgroup, snapshots);
        }
        // The ragged edge delivered everything of the previous view that ever will
        // be; the version history so far is globally stable.
        if previous_row.is_some() {
            for (subgroup, slot) in engines.iter() {
                if slot.persistent {
                    self.versions.seal(*subgroup);
                }
            }
        }

        let num_members = view.num_members();
        let initial_leader_rank = view.rank_of_leader();
        let endpoints: Vec<(NodeId, Endpoints)> = view
            .members
            .iter()
            .copied()
            .zip(view.endpoints.iter().copied())
            .collect();
        self.fabric.install_membership(&endpoints);
        // The point-to-point connection set is replaced wholesale; work already in
        // flight completes on the old set.
        self.p2p_connections
            .lock()
            .unwrap()
            .install_membership(&endpoints);

        let shared = Arc::new(view.clone());
        *self.shared_view.lock().unwrap() = Some(shared.clone());
        let _ = self.delivery.send(DeliveryJob::ViewChange(shared));

        self.events
            .emit(Event::ViewInstalled(ViewInstalledEvent {
                timestamp: SystemTime::now(),
                vid: view.vid,
                members: view.members.clone(),
                joined: view.joined.clone(),
                departed: view.departed.clone(),
                adequate: view.adequate,
            }));
        log::info!("{view}");

        self.state = Some(ActiveState {
            view,
            table,
            predicates,
            engines,
            parked: HashMap::new(),
            ragged_targets: HashMap::new(),
            last_heard: vec![Instant::now(); num_members],
            dirty: ColumnSet::all(),
            wedged: false,
            initial_leader_rank,
            i_know_i_am_leader: false,
        });
        self.flush_dirty();

        // Traffic that raced ahead of our install is replayed into the new state.
        let vid = self.state.as_ref().unwrap().table.vid();
        let replayable: Vec<PayloadEnvelope> = {
            let (matching, rest): (Vec<_>, Vec<_>) = self
                .future_payloads
                .drain(..)
                .partition(|p| p.vid == vid);
            self.future_payloads = rest;
            matching
        };
        for envelope in replayable {
            let sender = envelope.sender;
            self.handle_payload(sender, envelope);
        }
        let buffered_snapshots: Vec<StateSnapshot> = {
            let (matching, rest): (Vec<_>, Vec<_>) = self
                .future_snapshots
                .drain(..)
                .partition(|s| s.vid == vid);
            self.future_snapshots = rest;
            matching
        };
        for snapshot in buffered_snapshots {
            self.handle_snapshot(snapshot);
        }
    }

    /// Create objects for newly-hosted subgroups (restoring transferred state where
    /// provided) and tear down objects for subgroups this node no longer hosts.
    fn reconcile_objects(
        &mut self,
        view: &View,
        type_of_subgroup: &HashMap<SubgroupId, TypeId>,
        snapshots: &HashMap<SubgroupId, Vec<u8>>,
    ) {
        let hosted: HashSet<SubgroupId> = view.my_subgroups.keys().copied().collect();
        let current: Vec<SubgroupId> = self.objects.objects.lock().unwrap().keys().copied().collect();

        for subgroup in &current {
            if !hosted.contains(subgroup) {
                log::info!("tearing down replicated object of subgroup {subgroup}");
                self.dispatcher.deregister_subgroup(*subgroup);
                self.objects.objects.lock().unwrap().shift_remove(subgroup);
                let _ = self.delivery.send(DeliveryJob::Teardown(*subgroup));
            }
        }

        for subgroup in hosted {
            let type_id = match type_of_subgroup.get(&subgroup) {
                Some(t) => *t,
                None => continue,
            };
            let registration = match self.registrations.get(&type_id) {
                Some(r) => r,
                None => continue,
            };
            let mut objects = self.objects.objects.lock().unwrap();
            if objects.contains_key(&subgroup) {
                continue;
            }
            let mut object = (registration.factory)();
            if let Some(snapshot) = snapshots.get(&subgroup) {
                if let Err(e) = object.restore_state(snapshot) {
                    log::error!("failed to restore transferred state of {subgroup}: {e}");
                }
            }
            objects.insert(
                subgroup,
                RegisteredObject {
                    class: type_id,
                    object,
                    persistent: registration.persistent,
                },
            );
            drop(objects);
            self.dispatcher
                .register_subgroup(subgroup, &registration.descriptor);
        }
    }

    /// Leader side of the state-transfer boundary: after an install, the group
    /// leader ships the new view (with the snapshots it can capture itself) to
    /// every group joiner, and every shard leader streams object state to the
    /// members that just entered one of its shards.
    fn send_handoffs(&mut self) {
        self.send_shard_snapshots();
        let state = match &self.state {
            Some(state) => state,
            None => return,
        };
        if !state.view.i_am_leader() || state.view.joined.is_empty() {
            return;
        }
        let num_installed = state.table.local_row().num_installed;
        let wire = state.view.to_wire();
        let joiners = state.view.joined.clone();
        for joiner in joiners {
            if joiner == self.my_id {
                continue;
            }
            let mut snapshots = Vec::new();
            for (subgroup, shards) in state.view.subgroup_shard_views.iter().enumerate() {
                let subgroup = SubgroupId::new(subgroup as u32);
                let hosts_joiner = shards.iter().any(|sv| sv.rank_of(joiner).is_some());
                if !hosts_joiner {
                    continue;
                }
                let objects = self.objects.objects.lock().unwrap();
                if let Some(registered) = objects.get(&subgroup) {
                    match registered.object.capture_state() {
                        Ok(bytes) => snapshots.push((subgroup, bytes)),
                        Err(e) => {
                            log::error!("failed to capture state of {subgroup} for transfer: {e}")
                        }
                    }
                }
            }
            log::info!(
                "shipping view {} and {} snapshots to joiner {joiner}",
                wire.vid,
                snapshots.len()
            );
            self.fabric.send(
                joiner,
                FabricMessage::Handoff(ViewHandoff {
                    view: wire.clone(),
                    snapshots,
                    num_installed,
                }),
            );
        }
    }

    /// Stream object state to every member that just entered a shard this node
    /// leads. Receivers hold deliveries for the subgroup until the snapshot lands,
    /// and drop snapshots they did not wait for (group joiners already covered by
    /// the view handoff).
    fn send_shard_snapshots(&mut self) {
        let transfers: Vec<(NodeId, StateSnapshot)> = {
            let state = match &self.state {
                Some(state) => state,
                None => return,
            };
            let vid = state.table.vid();
            let mut transfers = Vec::new();
            for (subgroup, slot) in state.engines.iter() {
                let subview = slot.mc.subview();
                if subview.joined.is_empty()
                    || subview.members.len() == subview.joined.len()
                {
                    continue;
                }
                let shard_leader = subview
                    .members
                    .iter()
                    .find(|m| {
                        state
                            .view
                            .rank_of(**m)
                            .map(|r| !state.view.failed[r])
                            .unwrap_or(false)
                    })
                    .copied();
                if shard_leader != Some(self.my_id) {
                    continue;
                }
                let snapshot = {
                    let objects = self.objects.objects.lock().unwrap();
                    objects
                        .get(subgroup)
                        .map(|registered| registered.object.capture_state())
                };
                let state_bytes = match snapshot {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        log::error!("failed to capture state of {subgroup} for transfer: {e}");
                        continue;
                    }
                    None => continue,
                };
                for member in &subview.joined {
                    if *member == self.my_id {
                        continue;
                    }
                    transfers.push((
                        *member,
                        StateSnapshot {
                            vid,
                            subgroup: *subgroup,
                            state: state_bytes.clone(),
                        },
                    ));
                }
            }
            transfers
        };
        for (member, snapshot) in transfers {
            log::info!(
                "streaming state of subgroup {} to shard joiner {member}",
                snapshot.subgroup
            );
            self.fabric.send(member, FabricMessage::Snapshot(snapshot));
        }
    }

    // ------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------

    fn flush_dirty(&mut self) {
        let state = match &mut self.state {
            Some(state) => state,
            None => return,
        };
        if state.dirty == ColumnSet::empty() {
            return;
        }
        let patch = state.table.make_patch(state.dirty);
        state.dirty = ColumnSet::empty();
        let peers: Vec<NodeId> = state
            .table
            .live_ranks()
            .filter(|r| *r != state.table.my_rank())
            .map(|r| state.view.members[r])
            .collect();
        self.fabric
            .multicast(&peers, FabricMessage::SstPatch(patch));
    }

    fn halt(&mut self, error: GroupError) {
        log::error!("group halted: {error}");
        self.halted = true;
    }
}

fn lowest_live(table: &SharedStateTable) -> Option<usize> {
    table.live_ranks().next()
}

/// Whether a not-yet-installed entry of the local change ring already names `node`.
fn change_pending(state: &ActiveState, node: NodeId) -> bool {
    let row = state.table.local_row();
    (row.num_installed..row.num_changes)
        .any(|position| row.changes[state.table.change_slot(position)] == node)
}

fn all_live_wedged(table: &SharedStateTable) -> bool {
    table.live_ranks().all(|r| table.row(r).wedged)
}
