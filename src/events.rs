/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events emitted by the runtime's threads and delivered to user-registered
//! handlers (and, when enabled, the default logging handlers) on the event bus
//! thread.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::{NodeId, SeqNum, SubgroupId, Version, Vid};

/// A new view was installed.
#[derive(Clone, Debug)]
pub struct ViewInstalledEvent {
    pub timestamp: SystemTime,
    pub vid: Vid,
    pub members: Vec<NodeId>,
    pub joined: Vec<NodeId>,
    pub departed: Vec<NodeId>,
    pub adequate: bool,
}

/// A peer became suspected of failure on this node.
#[derive(Clone, Debug)]
pub struct SuspectEvent {
    pub timestamp: SystemTime,
    pub suspect: NodeId,
}

/// The leader proposed a membership change.
#[derive(Clone, Debug)]
pub struct ProposeChangeEvent {
    pub timestamp: SystemTime,
    pub node: NodeId,
    pub is_join: bool,
    pub num_changes: i32,
}

/// This node wedged for a view change.
#[derive(Clone, Debug)]
pub struct WedgeEvent {
    pub timestamp: SystemTime,
    pub vid: Vid,
}

/// An ordered message was delivered.
#[derive(Clone, Debug)]
pub struct DeliverEvent {
    pub timestamp: SystemTime,
    pub subgroup: SubgroupId,
    pub sender: NodeId,
    pub seq: SeqNum,
}

/// A version reached the durable store.
#[derive(Clone, Debug)]
pub struct PersistedEvent {
    pub timestamp: SystemTime,
    pub subgroup: SubgroupId,
    pub version: Version,
}

/// Envelope shipped over the event bus channel.
#[derive(Clone, Debug)]
pub enum Event {
    ViewInstalled(ViewInstalledEvent),
    Suspect(SuspectEvent),
    ProposeChange(ProposeChangeEvent),
    Wedge(WedgeEvent),
    Deliver(DeliverEvent),
    Persisted(PersistedEvent),
}

/// Cloneable emitter handed to every thread that publishes events. A sink without
/// a bus silently drops events.
#[derive(Clone)]
pub(crate) struct EventSink {
    sender: Option<Sender<Event>>,
}

impl EventSink {
    pub(crate) fn new(sender: Option<Sender<Event>>) -> EventSink {
        EventSink { sender }
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}
