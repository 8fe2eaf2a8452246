/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Fabric) for the pluggable node-to-node fabric, and the poller
//! thread that distributes inbound traffic to the runtime's threads.
//!
//! The runtime speaks three channels over the fabric: one-sided writes of shared
//! state table rows (not a protocol the application sees; ordering per write only),
//! a bulk multicast carrier for ordered message bodies, and a reliable point-to-point
//! byte stream per ordered pair of nodes that carries RPC traffic and is reopened on
//! every view change. Join requests and the view/state handoff to joining nodes ride
//! the point-to-point channel but are typed separately so the poller can route them.
//!
//! Fabric providers interact with the runtime's threads through implementations of
//! the [`Fabric`] trait: non-blocking sends, a polling receive, and a wholesale
//! membership replacement invoked at every view install.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::membership::view::WireView;
use crate::multicast::PayloadEnvelope;
use crate::sst::RowPatch;
use crate::types::basic::{Endpoints, NodeId, SubgroupId, Vid};

/// A message on the wire between two nodes.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum FabricMessage {
    /// A one-sided write publishing columns of the sender's shared state table row.
    SstPatch(RowPatch),
    /// An ordered-multicast message body.
    Payload(PayloadEnvelope),
    /// Point-to-point RPC traffic: a header followed by an opaque payload.
    P2p(Vec<u8>),
    /// A joining node announcing itself to the group leader.
    Join(JoinRequest),
    /// The leader shipping the new view and object state to a joining node.
    Handoff(ViewHandoff),
    /// A shard leader shipping object state to a member that just entered the
    /// shard.
    Snapshot(StateSnapshot),
    /// Synthesized by the fabric when the transport to a peer is lost.
    PeerUnreachable(NodeId),
}

/// Serialized object state streamed to a node that has just joined a shard. The
/// receiver holds deliveries for the subgroup until the snapshot is applied.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StateSnapshot {
    pub vid: Vid,
    pub subgroup: SubgroupId,
    pub state: Vec<u8>,
}

/// Sent by a joining node to the configured contact address.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct JoinRequest {
    pub joiner_id: NodeId,
    pub joiner_endpoints: Endpoints,
}

/// The view and serialized object state a joiner needs before it can participate.
/// Only then does the new view become active for the joiner's shards.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ViewHandoff {
    pub view: WireView,
    /// Serialized snapshot of each replicated object in a shard the joiner has
    /// just joined.
    pub snapshots: Vec<(SubgroupId, Vec<u8>)>,
    /// Seed for the joiner's GMS counters: changes applied so far in this group
    /// instance.
    pub num_installed: i32,
}

/// Pluggable node-to-node fabric.
///
/// Implementations must deliver messages between a given pair of nodes in FIFO order
/// (the monotonicity of table counters depends on it) but need not order deliveries
/// across pairs. All sends are non-blocking.
pub trait Fabric: Clone + Send + 'static {
    /// Replace the reachable-peer set wholesale. Called once at startup and again on
    /// every view install; point-to-point streams are reopened underneath.
    fn install_membership(&mut self, members: &[(NodeId, Endpoints)]);

    /// Send a message to one peer without blocking.
    fn send(&mut self, peer: NodeId, message: FabricMessage);

    /// Send the same message to every listed peer without blocking.
    fn multicast(&mut self, peers: &[NodeId], message: FabricMessage);

    /// Receive a message from any peer. Returns `None` immediately if nothing is
    /// available.
    fn recv(&mut self) -> Option<(NodeId, FabricMessage)>;
}

/// Spawn the poller thread, which polls the [`Fabric`] for messages and distributes
/// them into receivers for:
/// 1. protocol traffic (table patches, payloads, joins, handoffs, disconnects),
///    processed by the core thread, and
/// 2. point-to-point RPC bytes, processed by the P2P receive thread.
pub(crate) fn start_polling<F, E>(
    mut fabric: F,
    core: Sender<E>,
    shutdown: Receiver<()>,
) -> (JoinHandle<()>, Receiver<(NodeId, Vec<u8>)>)
where
    F: Fabric,
    E: From<(NodeId, FabricMessage)> + Send + 'static,
{
    let (to_p2p, p2p_receiver) = mpsc::channel();

    let poller = thread::Builder::new()
        .name(String::from("groupcast-poller"))
        .spawn(move || loop {
            match shutdown.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }

            match fabric.recv() {
                Some((origin, FabricMessage::P2p(bytes))) => {
                    let _ = to_p2p.send((origin, bytes));
                }
                Some((origin, message)) => {
                    if core.send(E::from((origin, message))).is_err() {
                        // Core thread has shut down; nothing left to route to.
                        return;
                    }
                }
                None => thread::yield_now(),
            }
        })
        .expect("spawning the poller thread");

    (poller, p2p_receiver)
}
