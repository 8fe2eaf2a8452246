/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! RPC dispatch.
//!
//! Typed invocations are serialized into payloads headed by the fixed
//! [header](header::RpcHeader) and carried either on the ordered multicast stream or
//! on the point-to-point channel. Inbound traffic is routed by a receiver table keyed
//! by opcode: ordered deliveries reach the dispatcher through the per-subgroup
//! delivery callback; point-to-point replies are handled inline on the receive
//! thread; point-to-point requests are serialized through a single-consumer FIFO to a
//! worker thread so long handlers do not block the receive thread (and so nested
//! point-to-point calls cannot re-enter). Cascading point-to-point messages are
//! rejected and the receive loop refuses to continue.
//!
//! A thread-local `in_rpc_handler` flag is set while any dispatcher-invoked handler
//! runs; nested calls that would deadlock consult it and switch strategies.

pub mod header;

pub mod pending;

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use indexmap::IndexMap;

use crate::error::{GroupError, ReplyError};
use crate::fabric::{Fabric, FabricMessage};
use crate::persistence::VersionLog;
use crate::types::basic::{FunctionId, NodeId, SubgroupId, TypeId};

use header::{decode_message, encode_message, CallBody, Opcode, ReplyBody, ReplyValue, RpcHeader};
use pending::PendingResults;

thread_local! {
    static IN_RPC_HANDLER: Cell<bool> = Cell::new(false);
}

/// True while the current thread is inside a dispatcher-invoked handler.
pub fn in_rpc_handler() -> bool {
    IN_RPC_HANDLER.with(|f| f.get())
}

/// Sets the re-entrancy flag for the lifetime of a handler invocation.
pub(crate) struct HandlerGuard;

impl HandlerGuard {
    pub(crate) fn enter() -> HandlerGuard {
        IN_RPC_HANDLER.with(|f| f.set(true));
        HandlerGuard
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        IN_RPC_HANDLER.with(|f| f.set(false));
    }
}

/// A replicated object instance: the collaborator the typed-object framework
/// registers per subgroup. Invocations arrive already demultiplexed to a function
/// id and marshalled arguments; the handler's return, if any, is marshalled as the
/// reply.
pub trait ReplicatedObject: Send {
    fn invoke(
        &mut self,
        function: FunctionId,
        args: &[u8],
        ctx: &InvocationContext,
    ) -> Result<Option<Vec<u8>>, GroupError>;

    /// Serialize the full object state, for persistence snapshots and state
    /// transfer to joining nodes.
    fn capture_state(&self) -> Result<Vec<u8>, GroupError>;

    /// Replace the object state from a serialized snapshot.
    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), GroupError>;
}

/// Capability passed into every handler invocation, in place of back-references
/// stored inside replicated state.
pub struct InvocationContext<'a> {
    /// The node the invocation came from.
    pub sender: NodeId,
    pub subgroup: SubgroupId,
    /// Read access to the local version history (persistent subgroups).
    pub versions: &'a VersionLog,
}

/// What the typed-object framework registers for a replicated type: its class id
/// and the functions it dispatches. Registration generates one receiver-table
/// record per (function, is_reply) pair.
#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    pub type_id: TypeId,
    pub functions: Vec<FunctionId>,
}

pub(crate) struct RegisteredObject {
    pub class: TypeId,
    pub object: Box<dyn ReplicatedObject>,
    pub persistent: bool,
}

/// The replicated object instances hosted by this node, keyed by subgroup.
pub(crate) struct ObjectRegistry {
    pub objects: Mutex<IndexMap<SubgroupId, RegisteredObject>>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> ObjectRegistry {
        ObjectRegistry {
            objects: Mutex::new(IndexMap::new()),
        }
    }
}

/// The receiver dispatch table: which opcodes are currently routable.
pub(crate) struct Dispatcher {
    receivers: Mutex<IndexMap<Opcode, ()>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Dispatcher {
        Dispatcher {
            receivers: Mutex::new(IndexMap::new()),
        }
    }

    /// Install receivers for a subgroup hosting an instance of the described class.
    pub(crate) fn register_subgroup(&self, subgroup: SubgroupId, descriptor: &ClassDescriptor) {
        let mut receivers = self.receivers.lock().unwrap();
        for function in &descriptor.functions {
            for is_reply in [false, true] {
                receivers.insert(
                    Opcode {
                        class_id: descriptor.type_id,
                        subgroup_id: subgroup,
                        function_id: *function,
                        is_reply,
                    },
                    (),
                );
            }
        }
    }

    /// Remove every receiver keyed by the subgroup (receiver destruction).
    pub(crate) fn deregister_subgroup(&self, subgroup: SubgroupId) {
        self.receivers
            .lock()
            .unwrap()
            .retain(|opcode, _| opcode.subgroup_id != subgroup);
    }

    pub(crate) fn knows(&self, opcode: &Opcode) -> bool {
        self.receivers.lock().unwrap().contains_key(opcode)
    }
}

/// Encode a call for the wire.
pub(crate) fn encode_call(
    class_id: TypeId,
    subgroup: SubgroupId,
    function: FunctionId,
    sender: NodeId,
    invocation: u64,
    args: &[u8],
) -> Result<Vec<u8>, GroupError> {
    let body = CallBody {
        invocation,
        args: args.to_vec(),
    }
    .try_to_vec()?;
    encode_message(
        RpcHeader {
            class_id,
            subgroup_id: subgroup,
            function_id: function,
            is_reply: false,
            flags: 0,
            sender_id: sender,
            payload_len: 0,
        },
        &body,
    )
}

/// Invoke the hosted object a decoded call addresses, under the re-entrancy flag.
/// Returns the reply body to route back, if the handler produced a value.
pub(crate) fn invoke_object(
    objects: &ObjectRegistry,
    dispatcher: &Dispatcher,
    versions: &VersionLog,
    from: NodeId,
    rpc_header: &RpcHeader,
    call: &CallBody,
) -> Option<ReplyBody> {
    if !dispatcher.knows(&rpc_header.opcode()) {
        log::error!(
            "received an RPC message with an unknown opcode ({}, {}, {}, {})",
            rpc_header.class_id.int(),
            rpc_header.subgroup_id,
            rpc_header.function_id.int(),
            rpc_header.is_reply,
        );
        return None;
    }
    let mut objects = objects.objects.lock().unwrap();
    let registered = match objects.get_mut(&rpc_header.subgroup_id) {
        Some(registered) if registered.class == rpc_header.class_id => registered,
        _ => {
            log::error!(
                "no object of class {} hosted for subgroup {}",
                rpc_header.class_id.int(),
                rpc_header.subgroup_id
            );
            return None;
        }
    };
    let ctx = InvocationContext {
        sender: from,
        subgroup: rpc_header.subgroup_id,
        versions,
    };
    let _guard = HandlerGuard::enter();
    match registered
        .object
        .invoke(rpc_header.function_id, &call.args, &ctx)
    {
        Ok(Some(value)) => Some(ReplyBody {
            invocation: call.invocation,
            value: ReplyValue::Ok(value),
        }),
        Ok(None) => None,
        Err(e) => {
            log::warn!(
                "handler for function {} of subgroup {} failed: {e}",
                rpc_header.function_id.int(),
                rpc_header.subgroup_id
            );
            Some(ReplyBody {
                invocation: call.invocation,
                value: ReplyValue::SerializationFailure,
            })
        }
    }
}

/// Send a reply body back to the caller over the point-to-point channel. The
/// fabric handle is shared with the view-change path, which replaces the connection
/// set wholesale under the same lock.
pub(crate) fn send_reply<F: Fabric>(
    p2p_connections: &Mutex<F>,
    my_id: NodeId,
    to: NodeId,
    call_header: &RpcHeader,
    reply: &ReplyBody,
) -> Result<(), GroupError> {
    let bytes = encode_message(
        RpcHeader {
            class_id: call_header.class_id,
            subgroup_id: call_header.subgroup_id,
            function_id: call_header.function_id,
            is_reply: true,
            flags: 0,
            sender_id: my_id,
            payload_len: 0,
        },
        &reply.try_to_vec()?,
    )?;
    p2p_connections
        .lock()
        .unwrap()
        .send(to, FabricMessage::P2p(bytes));
    Ok(())
}

/// Spawn the point-to-point receive thread: replies are resolved inline, requests
/// are handed to the FIFO worker, cascades and malformed headers stop the loop.
pub(crate) fn start_p2p_receiver(
    inbound: Receiver<(NodeId, Vec<u8>)>,
    pending: Arc<PendingResults>,
    shutdown: Arc<AtomicBool>,
) -> (JoinHandle<()>, Receiver<(NodeId, RpcHeader, CallBody)>) {
    let (to_fifo, fifo_receiver) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(String::from("groupcast-p2p-recv"))
        .spawn(move || loop {
            let (from, bytes) = match inbound.recv_timeout(Duration::from_millis(50)) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };
            let (rpc_header, payload) = match decode_message(&bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    // Malformed headers are a protocol violation; refuse to continue.
                    log::error!("p2p receive loop stopping: {e}");
                    return;
                }
            };
            if rpc_header.is_reply {
                // Replies are handled inline: they resolve a pending entry and
                // cannot block.
                match ReplyBody::try_from_slice(payload) {
                    Ok(reply) => {
                        let value = match reply.value {
                            ReplyValue::Ok(bytes) => Ok(bytes),
                            ReplyValue::SerializationFailure => {
                                Err(ReplyError::SerializationFailure(from))
                            }
                        };
                        pending.route_reply(
                            rpc_header.subgroup_id,
                            reply.invocation,
                            from,
                            value,
                        );
                    }
                    Err(e) => log::error!("dropping undecodable reply body from {from}: {e}"),
                }
            } else if rpc_header.cascade() {
                log::error!(
                    "p2p receive loop stopping: {}",
                    GroupError::InvalidRpcMessage(String::from(
                        "cascading p2p messages are not supported"
                    ))
                );
                return;
            } else {
                match CallBody::try_from_slice(payload) {
                    Ok(call) => {
                        if to_fifo.send((from, rpc_header, call)).is_err() {
                            return;
                        }
                    }
                    Err(e) => log::error!("dropping undecodable call body from {from}: {e}"),
                }
            }
        })
        .expect("spawning the p2p receive thread");
    (handle, fifo_receiver)
}

/// Spawn the FIFO worker thread: executes non-reply point-to-point requests
/// serially, so that handlers may themselves make nested point-to-point calls
/// without re-entrancy hazards.
pub(crate) fn start_fifo_worker<F: Fabric>(
    requests: Receiver<(NodeId, RpcHeader, CallBody)>,
    objects: Arc<ObjectRegistry>,
    dispatcher: Arc<Dispatcher>,
    versions: VersionLog,
    p2p_connections: Arc<Mutex<F>>,
    my_id: NodeId,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(String::from("groupcast-fifo-worker"))
        .spawn(move || loop {
            let (from, rpc_header, call) = match requests.recv_timeout(Duration::from_millis(50)) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };
            if let Some(reply) = invoke_object(&objects, &dispatcher, &versions, from, &rpc_header, &call)
            {
                if let Err(e) = send_reply(&p2p_connections, my_id, from, &rpc_header, &reply) {
                    log::warn!("failed to send p2p reply to {from}: {e}");
                }
            }
        })
        .expect("spawning the fifo worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ReplicatedObject for Echo {
        fn invoke(
            &mut self,
            function: FunctionId,
            args: &[u8],
            _ctx: &InvocationContext,
        ) -> Result<Option<Vec<u8>>, GroupError> {
            assert!(in_rpc_handler());
            if function == FunctionId::new(0) {
                Ok(Some(args.to_vec()))
            } else {
                Ok(None)
            }
        }

        fn capture_state(&self) -> Result<Vec<u8>, GroupError> {
            Ok(Vec::new())
        }

        fn restore_state(&mut self, _bytes: &[u8]) -> Result<(), GroupError> {
            Ok(())
        }
    }

    fn descriptor() -> ClassDescriptor {
        ClassDescriptor {
            type_id: TypeId::new(1),
            functions: vec![FunctionId::new(0), FunctionId::new(1)],
        }
    }

    fn registry_with_echo(subgroup: SubgroupId) -> (ObjectRegistry, Dispatcher) {
        let objects = ObjectRegistry::new();
        objects.objects.lock().unwrap().insert(
            subgroup,
            RegisteredObject {
                class: TypeId::new(1),
                object: Box::new(Echo),
                persistent: false,
            },
        );
        let dispatcher = Dispatcher::new();
        dispatcher.register_subgroup(subgroup, &descriptor());
        (objects, dispatcher)
    }

    #[test]
    fn invocations_route_to_the_hosted_object() {
        let sg = SubgroupId::new(0);
        let (objects, dispatcher) = registry_with_echo(sg);
        let versions = VersionLog::new();

        let call = CallBody {
            invocation: 11,
            args: vec![1, 2, 3],
        };
        let rpc_header = RpcHeader {
            class_id: TypeId::new(1),
            subgroup_id: sg,
            function_id: FunctionId::new(0),
            is_reply: false,
            flags: 0,
            sender_id: NodeId::new(5),
            payload_len: 0,
        };
        let reply =
            invoke_object(&objects, &dispatcher, &versions, NodeId::new(5), &rpc_header, &call)
                .unwrap();
        assert_eq!(reply.invocation, 11);
        assert!(matches!(reply.value, ReplyValue::Ok(ref v) if v == &vec![1, 2, 3]));
        assert!(!in_rpc_handler());
    }

    #[test]
    fn unknown_opcodes_are_dropped_without_replies() {
        let sg = SubgroupId::new(0);
        let (objects, dispatcher) = registry_with_echo(sg);
        let versions = VersionLog::new();

        let rpc_header = RpcHeader {
            class_id: TypeId::new(1),
            subgroup_id: sg,
            function_id: FunctionId::new(9),
            is_reply: false,
            flags: 0,
            sender_id: NodeId::new(5),
            payload_len: 0,
        };
        let call = CallBody {
            invocation: 1,
            args: vec![],
        };
        assert!(
            invoke_object(&objects, &dispatcher, &versions, NodeId::new(5), &rpc_header, &call)
                .is_none()
        );
    }

    #[test]
    fn deregistration_removes_every_receiver_of_the_subgroup() {
        let sg = SubgroupId::new(4);
        let dispatcher = Dispatcher::new();
        dispatcher.register_subgroup(sg, &descriptor());
        let opcode = Opcode {
            class_id: TypeId::new(1),
            subgroup_id: sg,
            function_id: FunctionId::new(0),
            is_reply: false,
        };
        assert!(dispatcher.knows(&opcode));
        dispatcher.deregister_subgroup(sg);
        assert!(!dispatcher.knows(&opcode));
    }
}
