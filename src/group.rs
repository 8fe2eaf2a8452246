/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that build and start a group node, and the handles applications use to
//! talk to it.
//!
//! A [`Group`] owns the runtime's long-lived threads: the poller that pumps the
//! fabric, the core thread that owns the shared state table and the membership
//! protocol, the delivery thread that invokes handlers in global order, the
//! point-to-point receive thread, the FIFO worker, and (when enabled) the
//! persistence thread and the event bus. Dropping the `Group` shuts them down in
//! dependency order.
//!
//! Applications obtain a [`SubgroupHandle`] for each subgroup this node is a member
//! of, and a [`NonmemberSubgroupHandle`] for subgroups it is not in. The first
//! carries ordered multicasts and point-to-point calls; the second only
//! point-to-point calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::config::Configuration;
use crate::error::GroupError;
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPair, HandlerPtr};
use crate::events::{
    DeliverEvent, Event, EventSink, PersistedEvent, ProposeChangeEvent, SuspectEvent,
    ViewInstalledEvent, WedgeEvent,
};
use crate::fabric::{start_polling, Fabric};
use crate::membership::allocation::{AllocationFn, SubgroupInfo};
use crate::membership::gms::{
    Bootstrap, CoreEvent, DeliveryJob, GroupCore, SendRequest, TypeRegistration,
};
use crate::membership::view::View;
use crate::multicast::PayloadEnvelope;
use crate::persistence::{
    start_persistence, DurableStore, MemoryStore, VersionLog, VersionRecord,
};
use crate::rpc::header::{decode_message, CallBody, ReplyValue};
use crate::rpc::pending::{PendingResults, QueryResults};
use crate::rpc::{
    encode_call, in_rpc_handler, invoke_object, send_reply, start_fifo_worker,
    start_p2p_receiver, ClassDescriptor, Dispatcher, ObjectRegistry, ReplicatedObject,
};
use crate::types::basic::{
    Endpoints, FunctionId, NodeId, SeqNum, ShardIndex, SubgroupId, TypeId, Version,
};
use crate::types::hlc::{HlcTimestamp, HybridClock};
use crate::error::ReplyError;
use crate::fabric::FabricMessage;

/// State shared between the application-facing handles and the runtime's threads.
struct GroupShared<F: Fabric> {
    my_id: NodeId,
    max_payload_size: usize,
    pending: Arc<PendingResults>,
    versions: VersionLog,
    view: Arc<Mutex<Option<Arc<View>>>>,
    p2p_connections: Arc<Mutex<F>>,
    core: Sender<CoreEvent>,
    invocations: AtomicU64,
    /// Held across enqueue-pending-and-submit so the pending queue order matches
    /// the multicast issue order.
    call_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
}

impl<F: Fabric> GroupShared<F> {
    fn current_view(&self) -> Option<Arc<View>> {
        self.view.lock().unwrap().clone()
    }
}

/// A group node: the replicated-state-machine runtime embedded in this process.
pub struct Group<F: Fabric> {
    shared: Arc<GroupShared<F>>,
    poller_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    core: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    p2p_receiver: Option<JoinHandle<()>>,
    fifo_worker: Option<JoinHandle<()>>,
    persistence: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
}

impl<F: Fabric> Group<F> {
    /// This node's id.
    pub fn my_id(&self) -> NodeId {
        self.shared.my_id
    }

    /// The currently installed view, if any.
    pub fn current_view(&self) -> Option<Arc<View>> {
        self.shared.current_view()
    }

    /// The ordered member list of the current view.
    pub fn members(&self) -> Vec<NodeId> {
        self.shared
            .current_view()
            .map(|v| v.members.clone())
            .unwrap_or_default()
    }

    /// Members of each shard of a subgroup in the current view.
    pub fn members_by_shard(&self, subgroup: SubgroupId) -> Vec<Vec<NodeId>> {
        self.shared
            .current_view()
            .and_then(|v| {
                v.subgroup_shard_views
                    .get(subgroup.index())
                    .map(|shards| shards.iter().map(|sv| sv.members.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// This node's rank in the current view.
    pub fn my_rank(&self) -> Option<usize> {
        self.shared.current_view().and_then(|v| v.my_rank)
    }

    /// The shard of a subgroup this node belongs to, if any.
    pub fn my_shard(&self, subgroup: SubgroupId) -> Option<ShardIndex> {
        self.shared
            .current_view()
            .and_then(|v| v.my_subgroups.get(&subgroup).copied())
    }

    /// Obtain a typed handle to a subgroup this node is a member of.
    pub fn get_subgroup(&self, subgroup: SubgroupId) -> Result<SubgroupHandle<F>, GroupError> {
        let view = self
            .shared
            .current_view()
            .ok_or(GroupError::InadequateView)?;
        if !view.adequate {
            return Err(GroupError::InadequateView);
        }
        if !view.my_subgroups.contains_key(&subgroup) {
            return Err(GroupError::InvalidSubgroup {
                subgroup,
                is_member: false,
            });
        }
        Ok(SubgroupHandle {
            shared: self.shared.clone(),
            subgroup,
            class: class_of(&view, subgroup)?,
        })
    }

    /// Obtain an external-caller handle to a subgroup this node is *not* in.
    pub fn get_nonmember_subgroup(
        &self,
        subgroup: SubgroupId,
    ) -> Result<NonmemberSubgroupHandle<F>, GroupError> {
        let view = self
            .shared
            .current_view()
            .ok_or(GroupError::InadequateView)?;
        if !view.adequate {
            return Err(GroupError::InadequateView);
        }
        if view.my_subgroups.contains_key(&subgroup) {
            return Err(GroupError::InvalidSubgroup {
                subgroup,
                is_member: true,
            });
        }
        Ok(NonmemberSubgroupHandle {
            inner: SubgroupHandle {
                shared: self.shared.clone(),
                subgroup,
                class: class_of(&view, subgroup)?,
            },
        })
    }

    /// Announce a local suspicion of a peer.
    pub fn report_failure(&self, peer: NodeId) {
        let _ = self.shared.core.send(CoreEvent::Suspect(peer));
    }

    /// Announce this node's own departure. Outstanding calls on this node resolve
    /// with a caller-removed error; the remaining members form a new view without
    /// it.
    pub fn leave(&self) {
        let _ = self.shared.core.send(CoreEvent::Leave);
    }
}

impl<F: Fabric> Drop for Group<F> {
    fn drop(&mut self) {
        // The order of thread shutdown matters: the core thread feeds the delivery
        // thread, and both assume the poller outlives the channels it routes into.
        self.shared.shutdown.store(true, Ordering::Relaxed);
        let _ = self.shared.core.send(CoreEvent::Shutdown);
        if let Some(core) = self.core.take() {
            let _ = core.join();
        }
        if let Some(delivery) = self.delivery.take() {
            let _ = delivery.join();
        }
        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        if let Some(p2p_receiver) = self.p2p_receiver.take() {
            let _ = p2p_receiver.join();
        }
        if let Some(fifo_worker) = self.fifo_worker.take() {
            let _ = fifo_worker.join();
        }
        if let Some(persistence) = self.persistence.take() {
            let _ = persistence.join();
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}

fn class_of(view: &View, subgroup: SubgroupId) -> Result<TypeId, GroupError> {
    view.subgroup_ids_by_type
        .iter()
        .find(|(_, ids)| ids.contains(&subgroup))
        .map(|(type_id, _)| *type_id)
        .ok_or(GroupError::InvalidSubgroup {
            subgroup,
            is_member: false,
        })
}

/// Handle to a subgroup this node is a member of.
pub struct SubgroupHandle<F: Fabric> {
    shared: Arc<GroupShared<F>>,
    subgroup: SubgroupId,
    class: TypeId,
}

impl<F: Fabric> SubgroupHandle<F> {
    pub fn subgroup(&self) -> SubgroupId {
        self.subgroup
    }

    /// Fire-and-forget totally ordered multicast to this node's shard.
    pub fn ordered_send<A: BorshSerialize>(
        &self,
        function: FunctionId,
        args: &A,
    ) -> Result<(), GroupError> {
        self.ordered(function, args, false).map(|_| ())
    }

    /// Ordered multicast that opens a pending result expecting one reply per shard
    /// member.
    pub fn ordered_query<A: BorshSerialize>(
        &self,
        function: FunctionId,
        args: &A,
    ) -> Result<QueryResults, GroupError> {
        self.ordered(function, args, true)
    }

    fn ordered<A: BorshSerialize>(
        &self,
        function: FunctionId,
        args: &A,
        expects_replies: bool,
    ) -> Result<QueryResults, GroupError> {
        let args = args.try_to_vec()?;
        let (completion, admitted) = mpsc::channel();
        let results;
        let invocation;
        {
            // Pending-queue order must match multicast issue order, and invocation
            // ids must be issued in that same order; the lock ties the three
            // together across concurrent callers.
            let _guard = self.shared.call_lock.lock().unwrap();
            invocation = self.shared.invocations.fetch_add(1, Ordering::SeqCst);
            let body = encode_call(
                self.class,
                self.subgroup,
                function,
                self.shared.my_id,
                invocation,
                &args,
            )?;
            if body.len() > self.shared.max_payload_size {
                return Err(GroupError::InvalidRpcMessage(format!(
                    "ordered payload of {} bytes exceeds max_payload_size {}",
                    body.len(),
                    self.shared.max_payload_size
                )));
            }
            results = self
                .shared
                .pending
                .open(invocation, self.subgroup, expects_replies);
            if self
                .shared
                .core
                .send(CoreEvent::Invoke(SendRequest {
                    subgroup: self.subgroup,
                    body,
                    completion,
                }))
                .is_err()
            {
                self.shared.pending.cancel(self.subgroup, invocation);
                return Err(GroupError::ShuttingDown);
            }
        }
        if in_rpc_handler() {
            // Called from inside a delivery handler: waiting for admission could
            // deadlock against our own delivery thread, so hand back the results
            // immediately.
            return Ok(results);
        }
        match admitted.recv() {
            Ok(Ok(())) => Ok(results),
            Ok(Err(e)) => {
                self.shared.pending.cancel(self.subgroup, invocation);
                Err(e)
            }
            Err(_) => {
                self.shared.pending.cancel(self.subgroup, invocation);
                Err(GroupError::ShuttingDown)
            }
        }
    }

    /// Point-to-point call to a nominated member of the subgroup, bypassing the
    /// ordered stream.
    pub fn p2p_send<A: BorshSerialize>(
        &self,
        target: NodeId,
        function: FunctionId,
        args: &A,
    ) -> Result<(), GroupError> {
        let bytes = self.encode_p2p(function, args, self.shared.invocations.fetch_add(1, Ordering::SeqCst))?;
        self.shared
            .p2p_connections
            .lock()
            .unwrap()
            .send(target, FabricMessage::P2p(bytes));
        Ok(())
    }

    /// Point-to-point query: the reply map is fulfilled immediately with the single
    /// target.
    pub fn p2p_query<A: BorshSerialize>(
        &self,
        target: NodeId,
        function: FunctionId,
        args: &A,
    ) -> Result<QueryResults, GroupError> {
        let invocation = self.shared.invocations.fetch_add(1, Ordering::SeqCst);
        let bytes = self.encode_p2p(function, args, invocation)?;
        let results = self
            .shared
            .pending
            .open_p2p(invocation, self.subgroup, target);
        self.shared
            .p2p_connections
            .lock()
            .unwrap()
            .send(target, FabricMessage::P2p(bytes));
        Ok(results)
    }

    fn encode_p2p<A: BorshSerialize>(
        &self,
        function: FunctionId,
        args: &A,
        invocation: u64,
    ) -> Result<Vec<u8>, GroupError> {
        let args = args.try_to_vec()?;
        encode_call(
            self.class,
            self.subgroup,
            function,
            self.shared.my_id,
            invocation,
            &args,
        )
    }

    /// State of this subgroup at an exact version.
    pub fn read_state(&self, version: Version) -> Result<Vec<u8>, GroupError> {
        self.shared.versions.read(self.subgroup, version)
    }

    /// State of this subgroup as of a wall-clock instant, gated by the temporal
    /// frontier.
    pub fn read_state_by_time(&self, at: HlcTimestamp) -> Result<Vec<u8>, GroupError> {
        self.shared.versions.read_by_time(self.subgroup, at)
    }

    /// The latest delivered version of this subgroup, if any.
    pub fn latest_version(&self) -> Option<Version> {
        self.shared.versions.latest_version(self.subgroup)
    }
}

/// External-caller handle to a subgroup this node is not a member of: only
/// point-to-point invocations are available.
pub struct NonmemberSubgroupHandle<F: Fabric> {
    inner: SubgroupHandle<F>,
}

impl<F: Fabric> NonmemberSubgroupHandle<F> {
    pub fn subgroup(&self) -> SubgroupId {
        self.inner.subgroup
    }

    pub fn p2p_send<A: BorshSerialize>(
        &self,
        target: NodeId,
        function: FunctionId,
        args: &A,
    ) -> Result<(), GroupError> {
        self.inner.p2p_send(target, function, args)
    }

    pub fn p2p_query<A: BorshSerialize>(
        &self,
        target: NodeId,
        function: FunctionId,
        args: &A,
    ) -> Result<QueryResults, GroupError> {
        self.inner.p2p_query(target, function, args)
    }
}

/// Builder for a [`Group`].
pub struct GroupBuilder<F: Fabric> {
    config: Configuration,
    fabric: F,
    info: SubgroupInfo,
    registrations: HashMap<TypeId, TypeRegistration>,
    initial_members: Vec<(NodeId, Endpoints)>,
    join_contact: Option<(NodeId, Endpoints)>,
    view_upcalls: Vec<Box<dyn Fn(&View) + Send>>,
    durable_store: Option<Box<dyn DurableStore>>,
    on_view_installed: Option<HandlerPtr<ViewInstalledEvent>>,
    on_suspect: Option<HandlerPtr<SuspectEvent>>,
    on_propose_change: Option<HandlerPtr<ProposeChangeEvent>>,
    on_wedge: Option<HandlerPtr<WedgeEvent>>,
    on_deliver: Option<HandlerPtr<DeliverEvent>>,
    on_persisted: Option<HandlerPtr<PersistedEvent>>,
}

impl<F: Fabric> GroupBuilder<F> {
    pub fn new(config: Configuration, fabric: F) -> GroupBuilder<F> {
        GroupBuilder {
            config,
            fabric,
            info: SubgroupInfo::new(),
            registrations: HashMap::new(),
            initial_members: Vec::new(),
            join_contact: None,
            view_upcalls: Vec::new(),
            durable_store: None,
            on_view_installed: None,
            on_suspect: None,
            on_propose_change: None,
            on_wedge: None,
            on_deliver: None,
            on_persisted: None,
        }
    }

    /// Register a replicated type: its dispatch descriptor, whether deliveries are
    /// versioned and persisted, the factory producing this node's instance, and the
    /// allocation function laying its subgroups out over a view.
    pub fn register_class(
        mut self,
        descriptor: ClassDescriptor,
        persistent: bool,
        allocator: AllocationFn,
        factory: Box<dyn Fn() -> Box<dyn ReplicatedObject> + Send>,
    ) -> Self {
        self.info.add(descriptor.type_id, allocator);
        self.registrations.insert(
            descriptor.type_id,
            TypeRegistration {
                descriptor,
                persistent,
                factory,
            },
        );
        self
    }

    /// The static membership this founding node starts with. Every founding member
    /// must be given the same list.
    pub fn initial_members(mut self, members: Vec<(NodeId, Endpoints)>) -> Self {
        self.initial_members = members;
        self
    }

    /// Join an existing group through a contact node instead of founding one.
    pub fn join_via(mut self, contact: NodeId, contact_endpoints: Endpoints) -> Self {
        self.join_contact = Some((contact, contact_endpoints));
        self
    }

    /// Add a view-change upcall, invoked on the delivery thread after the old
    /// view's final deliveries.
    pub fn on_view_change(mut self, upcall: Box<dyn Fn(&View) + Send>) -> Self {
        self.view_upcalls.push(upcall);
        self
    }

    /// Supply the durable store backing persistent subgroups. Defaults to an
    /// in-memory store when persistence is enabled without one.
    pub fn durable_store(mut self, store: Box<dyn DurableStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    pub fn on_view_installed(mut self, handler: HandlerPtr<ViewInstalledEvent>) -> Self {
        self.on_view_installed = Some(handler);
        self
    }

    pub fn on_suspect(mut self, handler: HandlerPtr<SuspectEvent>) -> Self {
        self.on_suspect = Some(handler);
        self
    }

    pub fn on_propose_change(mut self, handler: HandlerPtr<ProposeChangeEvent>) -> Self {
        self.on_propose_change = Some(handler);
        self
    }

    pub fn on_wedge(mut self, handler: HandlerPtr<WedgeEvent>) -> Self {
        self.on_wedge = Some(handler);
        self
    }

    pub fn on_deliver(mut self, handler: HandlerPtr<DeliverEvent>) -> Self {
        self.on_deliver = Some(handler);
        self
    }

    pub fn on_persisted(mut self, handler: HandlerPtr<PersistedEvent>) -> Self {
        self.on_persisted = Some(handler);
        self
    }

    /// Spawn the runtime's threads and start participating in the group.
    pub fn start(self) -> Group<F> {
        let my_id = self.config.identity.local_id;
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(PendingResults::new(shutdown.clone()));
        let dispatcher = Arc::new(Dispatcher::new());
        let objects = Arc::new(ObjectRegistry::new());
        let versions = VersionLog::new();
        let shared_view: Arc<Mutex<Option<Arc<View>>>> = Arc::new(Mutex::new(None));
        let p2p_connections = Arc::new(Mutex::new(self.fabric.clone()));

        // Event bus, when any handler or logging is enabled.
        let log_events = self.config.log_events;
        let max_payload_size = self.config.multicast.max_payload_size;
        let handlers = EventHandlers {
            view_installed: HandlerPair::new(log_events, self.on_view_installed),
            suspect: HandlerPair::new(log_events, self.on_suspect),
            propose_change: HandlerPair::new(log_events, self.on_propose_change),
            wedge: HandlerPair::new(log_events, self.on_wedge),
            deliver: HandlerPair::new(log_events, self.on_deliver),
            persisted: HandlerPair::new(log_events, self.on_persisted),
        };
        let (events, event_bus) = if handlers.is_empty() {
            (EventSink::new(None), None)
        } else {
            let (event_tx, event_rx) = mpsc::channel();
            (
                EventSink::new(Some(event_tx)),
                Some(start_event_bus(handlers, event_rx)),
            )
        };

        // Core channel, poller, and the p2p receive pipeline.
        let (core_tx, core_rx) = mpsc::channel::<CoreEvent>();
        let (poller_shutdown, poller_shutdown_rx) = mpsc::channel();
        let (poller, p2p_inbound) =
            start_polling::<F, CoreEvent>(self.fabric.clone(), core_tx.clone(), poller_shutdown_rx);
        let (p2p_receiver, fifo_requests) =
            start_p2p_receiver(p2p_inbound, pending.clone(), shutdown.clone());
        let fifo_worker = start_fifo_worker(
            fifo_requests,
            objects.clone(),
            dispatcher.clone(),
            versions.clone(),
            p2p_connections.clone(),
            my_id,
            shutdown.clone(),
        );

        // Persistence thread, when enabled.
        let (persist_tx, persistence) = if self.config.persistence.enabled {
            let store = self
                .durable_store
                .unwrap_or_else(|| Box::new(MemoryStore::new()));
            let (persist_tx, persist_rx) = mpsc::channel();
            let handle = start_persistence::<Box<dyn DurableStore>, CoreEvent>(
                store,
                persist_rx,
                core_tx.clone(),
            );
            (Some(persist_tx), Some(handle))
        } else {
            (None, None)
        };

        // Delivery thread.
        let (delivery_tx, delivery_rx) = mpsc::channel();
        let delivery = {
            let objects = objects.clone();
            let dispatcher = dispatcher.clone();
            let versions = versions.clone();
            let pending = pending.clone();
            let p2p_connections = p2p_connections.clone();
            let core = core_tx.clone();
            let events = events.clone();
            let view_upcalls = self.view_upcalls;
            thread::Builder::new()
                .name(String::from("groupcast-delivery"))
                .spawn(move || {
                    run_delivery(
                        delivery_rx,
                        objects,
                        dispatcher,
                        versions,
                        pending,
                        p2p_connections,
                        persist_tx,
                        core,
                        events,
                        view_upcalls,
                        my_id,
                    )
                })
                .expect("spawning the delivery thread")
        };

        // The core thread.
        let bootstrap = match self.join_contact {
            Some((contact, contact_endpoints)) => Bootstrap::Joining {
                contact,
                contact_endpoints,
            },
            None => Bootstrap::Founding(self.initial_members),
        };
        let core = {
            let core = GroupCore::new(
                my_id,
                self.config,
                self.fabric,
                p2p_connections.clone(),
                self.info,
                self.registrations,
                pending.clone(),
                dispatcher.clone(),
                objects.clone(),
                versions.clone(),
                shared_view.clone(),
                events,
                delivery_tx,
            );
            thread::Builder::new()
                .name(String::from("groupcast-core"))
                .spawn(move || core.run(core_rx, bootstrap))
                .expect("spawning the core thread")
        };

        Group {
            shared: Arc::new(GroupShared {
                my_id,
                max_payload_size,
                pending,
                versions,
                view: shared_view,
                p2p_connections,
                core: core_tx,
                invocations: AtomicU64::new(0),
                call_lock: Mutex::new(()),
                shutdown,
            }),
            poller_shutdown,
            poller: Some(poller),
            core: Some(core),
            delivery: Some(delivery),
            p2p_receiver: Some(p2p_receiver),
            fifo_worker: Some(fifo_worker),
            persistence,
            event_bus,
        }
    }
}

/// The delivery thread: invokes handlers in global order, versions persistent
/// deliveries, fulfills reply maps on self-receive, routes replies, and applies
/// view changes to the RPC layer strictly after the old view's final deliveries.
#[allow(clippy::too_many_arguments)]
fn run_delivery<F: Fabric>(
    jobs: Receiver<DeliveryJob>,
    objects: Arc<ObjectRegistry>,
    dispatcher: Arc<Dispatcher>,
    versions: VersionLog,
    pending: Arc<PendingResults>,
    p2p_connections: Arc<Mutex<F>>,
    persist: Option<Sender<(SubgroupId, VersionRecord)>>,
    core: Sender<CoreEvent>,
    events: EventSink,
    view_upcalls: Vec<Box<dyn Fn(&View) + Send>>,
    my_id: NodeId,
) {
    let mut clock = HybridClock::new();
    loop {
        match jobs.recv_timeout(Duration::from_millis(100)) {
            Ok(DeliveryJob::Batch {
                subgroup,
                persistent,
                shard_members,
                messages,
            }) => {
                let mut delivered_upto = None;
                for (seq, envelope) in messages {
                    if !deliver_one(
                        &objects,
                        &dispatcher,
                        &versions,
                        &pending,
                        &p2p_connections,
                        &persist,
                        &events,
                        &mut clock,
                        my_id,
                        subgroup,
                        persistent,
                        &shard_members,
                        seq,
                        envelope,
                    ) {
                        return;
                    }
                    delivered_upto = Some(seq);
                }
                if let Some(upto) = delivered_upto {
                    if core
                        .send(CoreEvent::Delivered { subgroup, upto })
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Ok(DeliveryJob::ViewChange(view)) => {
                pending.on_view_change(&view);
                for upcall in &view_upcalls {
                    upcall(&view);
                }
            }
            Ok(DeliveryJob::Teardown(subgroup)) => {
                pending.destroy_subgroup(subgroup);
                versions.forget(subgroup);
            }
            Ok(DeliveryJob::Shutdown) => return,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Deliver a single ordered message. Returns false when the delivery loop must
/// refuse to continue (malformed traffic or shutdown).
#[allow(clippy::too_many_arguments)]
fn deliver_one<F: Fabric>(
    objects: &ObjectRegistry,
    dispatcher: &Dispatcher,
    versions: &VersionLog,
    pending: &PendingResults,
    p2p_connections: &Mutex<F>,
    persist: &Option<Sender<(SubgroupId, VersionRecord)>>,
    events: &EventSink,
    clock: &mut HybridClock,
    my_id: NodeId,
    subgroup: SubgroupId,
    persistent: bool,
    shard_members: &[NodeId],
    seq: SeqNum,
    envelope: PayloadEnvelope,
) -> bool {
    let (rpc_header, payload) = match decode_message(&envelope.body) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::error!("delivery stopping on malformed ordered message: {e}");
            return false;
        }
    };
    let call = match CallBody::try_from_slice(payload) {
        Ok(call) => call,
        Err(e) => {
            log::error!("delivery stopping on undecodable call body: {e}");
            return false;
        }
    };
    let reply = invoke_object(objects, dispatcher, versions, rpc_header.sender_id, &rpc_header, &call);
    events.emit(Event::Deliver(DeliverEvent {
        timestamp: SystemTime::now(),
        subgroup,
        sender: rpc_header.sender_id,
        seq,
    }));

    if persistent {
        let snapshot = {
            let objects = objects.objects.lock().unwrap();
            objects
                .get(&subgroup)
                .map(|registered| registered.object.capture_state())
        };
        match snapshot {
            Some(Ok(bytes)) => {
                let record = versions.append(subgroup, envelope.vid, seq, clock.now(), bytes);
                if let Some(persist) = persist {
                    let _ = persist.send((subgroup, record));
                }
            }
            Some(Err(e)) => log::error!("failed to capture state of {subgroup}: {e}"),
            None => {}
        }
    }

    if rpc_header.sender_id == my_id {
        // Self-receive: fulfill the reply map with the shard membership of the view
        // current at delivery time; our own reply, if any, resolves inline.
        if let Err(e) = pending.fulfill_next(subgroup, call.invocation, shard_members) {
            log::error!("delivery stopping: {e}");
            return false;
        }
        if let Some(reply) = reply {
            let value = match reply.value {
                ReplyValue::Ok(bytes) => Ok(bytes),
                ReplyValue::SerializationFailure => Err(ReplyError::SerializationFailure(my_id)),
            };
            pending.route_reply(subgroup, reply.invocation, my_id, value);
        }
    } else if let Some(reply) = reply {
        if let Err(e) = send_reply(p2p_connections, my_id, rpc_header.sender_id, &rpc_header, &reply)
        {
            log::warn!("failed to reply to {}: {e}", rpc_header.sender_id);
        }
    }
    true
}
