/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The integration suite runs whole groups in-process: every node gets a
//! [ChannelFabric] that passes fabric messages between threads over channels, small
//! demo replicated objects expose their state through shared handles, and the tests
//! poll with sleeps until the group converges.
//!
//! The scenarios cover the user-visible contract: identical persistent version
//! histories on every member, cross-sender round-robin delivery order, reads over
//! the point-to-point channel, crash recovery through the ragged-edge flush,
//! temporal read gating, voluntary departure with caller-removed completion, and a
//! join with state transfer.

use borsh::{BorshDeserialize, BorshSerialize};
use groupcast::membership::allocation::contiguous_shard;
use groupcast::{
    AllocationFn, ClassDescriptor, Configuration, Endpoints, Fabric, FunctionId, Group,
    GroupBuilder, GroupError, HlcTimestamp, InvocationContext, NodeId, ProvisioningError,
    ReplicatedObject, ReplyError, RpcMode, ShardSpec, SubgroupId, SubgroupSpec, TypeId,
    Version,
};
use groupcast::fabric::FabricMessage;
use log::LevelFilter;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static LOGGER_INIT: Once = Once::new();

// Set up a logger that prints all enabled log messages to stdout.
fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn now_hlc() -> HlcTimestamp {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64;
    HlcTimestamp::new(micros, 0)
}

/// A fabric that passes messages from and to in-process nodes using channels.
#[derive(Clone)]
struct ChannelFabric {
    my_id: NodeId,
    all_peers: Arc<Mutex<HashMap<NodeId, Sender<(NodeId, FabricMessage)>>>>,
    inbox: Arc<Mutex<Receiver<(NodeId, FabricMessage)>>>,
}

impl Fabric for ChannelFabric {
    fn install_membership(&mut self, _members: &[(NodeId, Endpoints)]) {
        // Addressing is by node id in the shared registry; nothing to reopen.
    }

    fn send(&mut self, peer: NodeId, message: FabricMessage) {
        if let Some(peer) = self.all_peers.lock().unwrap().get(&peer) {
            let _ = peer.send((self.my_id, message));
        }
    }

    fn multicast(&mut self, peers: &[NodeId], message: FabricMessage) {
        for peer in peers {
            self.send(*peer, message.clone());
        }
    }

    fn recv(&mut self) -> Option<(NodeId, FabricMessage)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

fn mock_fabric(ids: &[u32]) -> Vec<ChannelFabric> {
    let mut all_peers = HashMap::new();
    let inboxes: Vec<(NodeId, Receiver<(NodeId, FabricMessage)>)> = ids
        .iter()
        .map(|id| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(NodeId::new(*id), sender);
            (NodeId::new(*id), receiver)
        })
        .collect();
    let all_peers = Arc::new(Mutex::new(all_peers));
    inboxes
        .into_iter()
        .map(|(my_id, inbox)| ChannelFabric {
            my_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}

fn endpoints_of(ids: &[u32]) -> Vec<(NodeId, Endpoints)> {
    ids.iter()
        .map(|id| {
            (
                NodeId::new(*id),
                Endpoints::new(Ipv4Addr::LOCALHOST, 23580, 23581, 23582, 23583),
            )
        })
        .collect()
}

/// One subgroup with one shard over a fixed rank range, with explicit sender
/// flags.
fn offset_shard(offset: usize, size: usize, senders: Vec<bool>) -> AllocationFn {
    Box::new(move |view, next_unassigned| {
        if view.num_members() < offset + size {
            return Err(ProvisioningError::TooFewMembers {
                needed: offset + size,
                available: view.num_members(),
            });
        }
        *next_unassigned = (*next_unassigned).max(offset + size);
        Ok(vec![SubgroupSpec {
            shards: vec![ShardSpec {
                members: view.members[offset..offset + size].to_vec(),
                is_sender: Some(senders.clone()),
                mode: RpcMode::Ordered,
            }],
        }])
    })
}

/// One subgroup with one shard over every member of the view, so the layout
/// re-provisions as membership shrinks or grows.
fn whole_group_shard(min_members: usize) -> AllocationFn {
    Box::new(move |view, next_unassigned| {
        if view.num_members() < min_members {
            return Err(ProvisioningError::TooFewMembers {
                needed: min_members,
                available: view.num_members(),
            });
        }
        *next_unassigned = view.num_members();
        Ok(vec![SubgroupSpec {
            shards: vec![ShardSpec::ordered(view.members.clone())],
        }])
    })
}

fn config_for(id: u32, persistence: bool) -> Configuration {
    let mut config = Configuration::new(NodeId::new(id));
    config.membership.suspicion_timeout = Duration::from_millis(400);
    config.persistence.enabled = persistence;
    config
}

// ---------------------------------------------------------------------------
// Demo replicated objects
// ---------------------------------------------------------------------------

const COUNTER_TYPE: TypeId = TypeId::new(1);
const CHANGE_STATE: FunctionId = FunctionId::new(0);

/// Keeps a single number; every update is versioned when the subgroup is
/// persistent.
struct Counter {
    state: Arc<Mutex<i64>>,
}

impl ReplicatedObject for Counter {
    fn invoke(
        &mut self,
        function: FunctionId,
        args: &[u8],
        _ctx: &InvocationContext,
    ) -> Result<Option<Vec<u8>>, GroupError> {
        if function == CHANGE_STATE {
            *self.state.lock().unwrap() = i64::try_from_slice(args)?;
        }
        Ok(None)
    }

    fn capture_state(&self) -> Result<Vec<u8>, GroupError> {
        Ok(self.state.lock().unwrap().try_to_vec()?)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), GroupError> {
        *self.state.lock().unwrap() = i64::try_from_slice(bytes)?;
        Ok(())
    }
}

fn counter_descriptor() -> ClassDescriptor {
    ClassDescriptor {
        type_id: COUNTER_TYPE,
        functions: vec![CHANGE_STATE],
    }
}

const LOG_TYPE: TypeId = TypeId::new(2);
const APPEND: FunctionId = FunctionId::new(0);
const PRINT: FunctionId = FunctionId::new(1);

/// Appends strings; `print` returns the concatenated log.
struct LogObject {
    log: Arc<Mutex<String>>,
}

impl ReplicatedObject for LogObject {
    fn invoke(
        &mut self,
        function: FunctionId,
        args: &[u8],
        _ctx: &InvocationContext,
    ) -> Result<Option<Vec<u8>>, GroupError> {
        if function == APPEND {
            let entry = String::try_from_slice(args)?;
            self.log.lock().unwrap().push_str(&entry);
            Ok(None)
        } else if function == PRINT {
            Ok(Some(self.log.lock().unwrap().try_to_vec()?))
        } else {
            Ok(None)
        }
    }

    fn capture_state(&self) -> Result<Vec<u8>, GroupError> {
        Ok(self.log.lock().unwrap().try_to_vec()?)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), GroupError> {
        *self.log.lock().unwrap() = String::try_from_slice(bytes)?;
        Ok(())
    }
}

fn log_descriptor() -> ClassDescriptor {
    ClassDescriptor {
        type_id: LOG_TYPE,
        functions: vec![APPEND, PRINT],
    }
}

const KV_TYPE: TypeId = TypeId::new(3);
const PUT: FunctionId = FunctionId::new(0);
const GET: FunctionId = FunctionId::new(1);

struct KvObject {
    map: Arc<Mutex<HashMap<String, String>>>,
}

impl ReplicatedObject for KvObject {
    fn invoke(
        &mut self,
        function: FunctionId,
        args: &[u8],
        _ctx: &InvocationContext,
    ) -> Result<Option<Vec<u8>>, GroupError> {
        if function == PUT {
            let (key, value) = <(String, String)>::try_from_slice(args)?;
            self.map.lock().unwrap().insert(key, value);
            Ok(None)
        } else if function == GET {
            let key = String::try_from_slice(args)?;
            let value = self.map.lock().unwrap().get(&key).cloned();
            Ok(Some(value.try_to_vec()?))
        } else {
            Ok(None)
        }
    }

    fn capture_state(&self) -> Result<Vec<u8>, GroupError> {
        let entries: Vec<(String, String)> = {
            let map = self.map.lock().unwrap();
            let mut entries: Vec<(String, String)> =
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            entries.sort();
            entries
        };
        Ok(entries.try_to_vec()?)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), GroupError> {
        let entries = Vec::<(String, String)>::try_from_slice(bytes)?;
        *self.map.lock().unwrap() = entries.into_iter().collect();
        Ok(())
    }
}

fn kv_descriptor() -> ClassDescriptor {
    ClassDescriptor {
        type_id: KV_TYPE,
        functions: vec![PUT, GET],
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Two-node persistent counter: both members assign the same dense versions to the
/// same delivered states, and both report the same latest version.
#[test]
fn persistent_counter_versions_agree() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 1];
    let fabrics = mock_fabric(&ids);
    let states: Vec<Arc<Mutex<i64>>> = (0..2).map(|_| Arc::new(Mutex::new(0))).collect();

    let groups: Vec<Group<ChannelFabric>> = ids
        .iter()
        .zip(fabrics)
        .map(|(id, fabric)| {
            let state = states[*id as usize].clone();
            GroupBuilder::new(config_for(*id, true), fabric)
                .initial_members(endpoints_of(&ids))
                .register_class(
                    counter_descriptor(),
                    true,
                    contiguous_shard(2),
                    Box::new(move || {
                        Box::new(Counter {
                            state: state.clone(),
                        })
                    }),
                )
                .start()
        })
        .collect();

    let subgroup = SubgroupId::new(0);
    let handles: Vec<_> = groups
        .iter()
        .map(|g| {
            wait_until("subgroup handle", Duration::from_secs(10), || {
                g.get_subgroup(subgroup).is_ok()
            });
            g.get_subgroup(subgroup).unwrap()
        })
        .collect();

    for value in [1000i64, 2000, 3000] {
        handles[0].ordered_send(CHANGE_STATE, &value).unwrap();
    }
    for value in [1001i64, 2001, 3001] {
        handles[1].ordered_send(CHANGE_STATE, &value).unwrap();
    }

    wait_until("six versions on both nodes", Duration::from_secs(20), || {
        handles
            .iter()
            .all(|h| h.latest_version() == Some(Version::new(5)))
    });

    for v in 0..6 {
        let on_0 = handles[0].read_state(Version::new(v)).unwrap();
        let on_1 = handles[1].read_state(Version::new(v)).unwrap();
        assert_eq!(on_0, on_1, "version {v} disagrees between the members");
    }
    // The round-robin interleaving of two balanced senders is fixed.
    let sequence: Vec<i64> = (0..6)
        .map(|v| i64::try_from_slice(&handles[0].read_state(Version::new(v)).unwrap()).unwrap())
        .collect();
    assert_eq!(sequence, vec![1000, 1001, 2000, 2001, 3000, 3001]);
}

/// Three-shard layout: cross-sender delivery order within a shard is the
/// round-robin order, and a last-writer-wins map converges identically on every
/// member.
#[test]
fn multi_subgroup_layout_agrees() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 1, 2, 3, 4, 5];
    let fabrics = mock_fabric(&ids);
    let logs: Vec<Arc<Mutex<String>>> = (0..6).map(|_| Arc::new(Mutex::new(String::new()))).collect();
    let maps: Vec<Arc<Mutex<HashMap<String, String>>>> =
        (0..6).map(|_| Arc::new(Mutex::new(HashMap::new()))).collect();

    let groups: Vec<Group<ChannelFabric>> = ids
        .iter()
        .zip(fabrics)
        .map(|(id, fabric)| {
            let log = logs[*id as usize].clone();
            let map = maps[*id as usize].clone();
            GroupBuilder::new(config_for(*id, false), fabric)
                .initial_members(endpoints_of(&ids))
                .register_class(
                    log_descriptor(),
                    false,
                    contiguous_shard(3),
                    Box::new(move || Box::new(LogObject { log: log.clone() })),
                )
                .register_class(
                    kv_descriptor(),
                    false,
                    // Nodes 3, 4, 5; only 4 and 5 send, so the round-robin order
                    // is exactly their interleaving.
                    offset_shard(3, 3, vec![false, true, true]),
                    Box::new(move || Box::new(KvObject { map: map.clone() })),
                )
                .start()
        })
        .collect();

    let log_subgroup = SubgroupId::new(0);
    let kv_subgroup = SubgroupId::new(1);
    wait_until("adequate view everywhere", Duration::from_secs(10), || {
        groups.iter().all(|g| g.current_view().map(|v| v.adequate).unwrap_or(false))
    });

    // Subgroup A: one append per member, issued out of rank order; delivery is in
    // rank order for the first round regardless.
    let a2 = groups[2].get_subgroup(log_subgroup).unwrap();
    a2.ordered_send(APPEND, &String::from("Write from 2...")).unwrap();
    let a0 = groups[0].get_subgroup(log_subgroup).unwrap();
    a0.ordered_send(APPEND, &String::from("Write from 0...")).unwrap();
    let a1 = groups[1].get_subgroup(log_subgroup).unwrap();
    a1.ordered_send(APPEND, &String::from("Write from 1...")).unwrap();

    let expected = "Write from 0...Write from 1...Write from 2...";
    wait_until("log convergence", Duration::from_secs(20), || {
        (0..3).all(|n| *logs[n].lock().unwrap() == expected)
    });

    // An ordered print query returns the same concatenation from every member.
    let results = a0.ordered_query(PRINT, &()).unwrap();
    let replies = results.get().unwrap();
    assert_eq!(replies.len(), 3);
    for n in 0..3u32 {
        assert_eq!(
            replies.reply_as::<String>(NodeId::new(n)).unwrap(),
            expected,
            "print reply from node {n}"
        );
    }

    // Subgroup B: interleaved writers 4, 5, 4, 5; every member must agree on the
    // final value for the key.
    let b4 = groups[4].get_subgroup(kv_subgroup).unwrap();
    let b5 = groups[5].get_subgroup(kv_subgroup).unwrap();
    b4.ordered_send(PUT, &(String::from("Ken"), String::from("Birman"))).unwrap();
    b5.ordered_send(PUT, &(String::from("Ken"), String::from("Woodberry"))).unwrap();
    b4.ordered_send(PUT, &(String::from("Ken"), String::from("Birman"))).unwrap();
    b5.ordered_send(PUT, &(String::from("Ken"), String::from("Woodberry"))).unwrap();

    wait_until("map convergence", Duration::from_secs(20), || {
        (3..6).all(|n| {
            maps[n].lock().unwrap().get("Ken").map(String::as_str) == Some("Woodberry")
        })
    });
}

/// Point-to-point read: a member of one subgroup queries a member of another
/// subgroup directly, bypassing the ordered stream.
#[test]
fn p2p_query_reads_remote_state() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 1, 2, 3, 4, 5];
    let fabrics = mock_fabric(&ids);
    let logs: Vec<Arc<Mutex<String>>> = (0..6).map(|_| Arc::new(Mutex::new(String::new()))).collect();

    let groups: Vec<Group<ChannelFabric>> = ids
        .iter()
        .zip(fabrics)
        .map(|(id, fabric)| {
            let log = logs[*id as usize].clone();
            GroupBuilder::new(config_for(*id, false), fabric)
                .initial_members(endpoints_of(&ids))
                .register_class(
                    log_descriptor(),
                    false,
                    contiguous_shard(3),
                    Box::new(move || Box::new(LogObject { log: log.clone() })),
                )
                .start()
        })
        .collect();

    let subgroup = SubgroupId::new(0);
    wait_until("adequate view everywhere", Duration::from_secs(10), || {
        groups.iter().all(|g| g.current_view().map(|v| v.adequate).unwrap_or(false))
    });

    let a0 = groups[0].get_subgroup(subgroup).unwrap();
    a0.ordered_send(APPEND, &String::from("hello")).unwrap();
    wait_until("append delivered at node 2", Duration::from_secs(20), || {
        *logs[2].lock().unwrap() == "hello"
    });

    // Node 4 is not in the log subgroup: a member handle is refused, an external
    // handle works.
    assert!(matches!(
        groups[4].get_subgroup(subgroup),
        Err(GroupError::InvalidSubgroup { is_member: false, .. })
    ));
    let external = groups[4].get_nonmember_subgroup(subgroup).unwrap();
    let results = external.p2p_query(NodeId::new(2), PRINT, &()).unwrap();
    let replies = results.get().unwrap();
    assert_eq!(
        replies.reply_as::<String>(NodeId::new(2)).unwrap(),
        "hello"
    );
}

/// Crash during delivery: the survivors deliver the crashed sender's stable
/// prefix through the ragged-edge flush, never anything later, and the first
/// message of the next view restarts the sequence encoding at zero.
#[test]
fn crash_flushes_stable_prefix_and_reencodes() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 1, 2, 3, 4];
    let fabrics = mock_fabric(&ids);
    let logs: Vec<Arc<Mutex<String>>> = (0..5).map(|_| Arc::new(Mutex::new(String::new()))).collect();
    let deliveries: Arc<Mutex<Vec<(u32, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut groups: Vec<Option<Group<ChannelFabric>>> = ids
        .iter()
        .zip(fabrics)
        .map(|(id, fabric)| {
            let log = logs[*id as usize].clone();
            let mut builder = GroupBuilder::new(config_for(*id, false), fabric)
                .initial_members(endpoints_of(&ids))
                .register_class(
                    log_descriptor(),
                    false,
                    whole_group_shard(2),
                    Box::new(move || Box::new(LogObject { log: log.clone() })),
                );
            if *id == 0 {
                let deliveries = deliveries.clone();
                builder = builder.on_deliver(Box::new(move |event| {
                    deliveries
                        .lock()
                        .unwrap()
                        .push((event.sender.int(), event.seq.int()));
                }));
            }
            Some(builder.start())
        })
        .collect();

    let subgroup = SubgroupId::new(0);
    wait_until("adequate view everywhere", Duration::from_secs(10), || {
        groups.iter().all(|g| {
            g.as_ref()
                .unwrap()
                .current_view()
                .map(|v| v.adequate)
                .unwrap_or(false)
        })
    });

    // Sender 2 emits two messages, then crashes before a third.
    {
        let a2 = groups[2].as_ref().unwrap().get_subgroup(subgroup).unwrap();
        a2.ordered_send(APPEND, &String::from("(2,0)")).unwrap();
        a2.ordered_send(APPEND, &String::from("(2,1)")).unwrap();
    }
    // Let the bodies spread to every survivor before the crash.
    thread::sleep(Duration::from_millis(300));
    drop(groups[2].take());

    // The survivors form a four-member view, delivering exactly the stable prefix
    // on the way.
    wait_until("view without node 2", Duration::from_secs(20), || {
        [0usize, 1, 3, 4].iter().all(|n| {
            groups[*n]
                .as_ref()
                .unwrap()
                .members()
                == vec![NodeId::new(0), NodeId::new(1), NodeId::new(3), NodeId::new(4)]
        })
    });
    for n in [0usize, 1, 3, 4] {
        assert_eq!(*logs[n].lock().unwrap(), "(2,0)(2,1)", "log at node {n}");
    }
    // Both flush deliveries came from sender rank 2 in the five-sender encoding.
    wait_until("flush deliveries observed", Duration::from_secs(10), || {
        deliveries.lock().unwrap().len() == 2
    });
    assert_eq!(*deliveries.lock().unwrap(), vec![(2, 2), (2, 7)]);

    // The first post-view message from sender 0 re-encodes as sequence number 0.
    deliveries.lock().unwrap().clear();
    let a0 = groups[0].as_ref().unwrap().get_subgroup(subgroup).unwrap();
    a0.ordered_send(APPEND, &String::from("(0,0)v1")).unwrap();
    wait_until("post-view delivery everywhere", Duration::from_secs(20), || {
        [0usize, 1, 3, 4]
            .iter()
            .all(|n| logs[*n].lock().unwrap().ends_with("(0,0)v1"))
    });
    let recorded = deliveries.lock().unwrap().clone();
    assert_eq!(recorded, vec![(0, 0)]);
}

/// Temporal read gate: a fresh read either returns the latest state or fails with
/// the beyond-frontier error; it never returns an undelivered intermediate.
#[test]
fn temporal_reads_are_gated() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 1];
    let fabrics = mock_fabric(&ids);
    let states: Vec<Arc<Mutex<i64>>> = (0..2).map(|_| Arc::new(Mutex::new(0))).collect();

    let groups: Vec<Group<ChannelFabric>> = ids
        .iter()
        .zip(fabrics)
        .map(|(id, fabric)| {
            let state = states[*id as usize].clone();
            GroupBuilder::new(config_for(*id, true), fabric)
                .initial_members(endpoints_of(&ids))
                .register_class(
                    counter_descriptor(),
                    true,
                    contiguous_shard(2),
                    Box::new(move || {
                        Box::new(Counter {
                            state: state.clone(),
                        })
                    }),
                )
                .start()
        })
        .collect();

    let subgroup = SubgroupId::new(0);
    wait_until("subgroup handles", Duration::from_secs(10), || {
        groups.iter().all(|g| g.get_subgroup(subgroup).is_ok())
    });
    let handle = groups[0].get_subgroup(subgroup).unwrap();
    let other = groups[1].get_subgroup(subgroup).unwrap();
    handle.ordered_send(CHANGE_STATE, &7i64).unwrap();
    other.ordered_send(CHANGE_STATE, &8i64).unwrap();
    wait_until("both deliveries versioned", Duration::from_secs(20), || {
        handle.latest_version() == Some(Version::new(1))
    });

    let latest = handle.read_state(Version::new(1)).unwrap();
    match handle.read_state_by_time(now_hlc()) {
        Ok(bytes) => assert_eq!(bytes, latest, "a successful fresh read must be the latest state"),
        Err(GroupError::TimestampBeyondFrontier { .. }) => {}
        Err(e) => panic!("unexpected error from read_state_by_time: {e}"),
    }

    // A read at the epoch is never beyond the frontier once something is stable,
    // and a read far in the future always is.
    let far_future = HlcTimestamp::new(now_hlc().micros + 60_000_000, 0);
    assert!(matches!(
        handle.read_state_by_time(far_future),
        Err(GroupError::TimestampBeyondFrontier { .. })
    ));
}

/// Caller removed: a leaver's outstanding reply map completes with caller-removed
/// errors, and the remaining members keep delivering and replying among
/// themselves.
#[test]
fn leaver_pending_results_resolve_caller_removed() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 1, 2];
    let fabrics = mock_fabric(&ids);
    let logs: Vec<Arc<Mutex<String>>> = (0..3).map(|_| Arc::new(Mutex::new(String::new()))).collect();

    let groups: Vec<Group<ChannelFabric>> = ids
        .iter()
        .zip(fabrics)
        .map(|(id, fabric)| {
            let log = logs[*id as usize].clone();
            GroupBuilder::new(config_for(*id, false), fabric)
                .initial_members(endpoints_of(&ids))
                .register_class(
                    log_descriptor(),
                    false,
                    whole_group_shard(2),
                    Box::new(move || Box::new(LogObject { log: log.clone() })),
                )
                .start()
        })
        .collect();

    let subgroup = SubgroupId::new(0);
    wait_until("adequate view everywhere", Duration::from_secs(10), || {
        groups.iter().all(|g| g.current_view().map(|v| v.adequate).unwrap_or(false))
    });

    // Node 0 opens a query against the three-node shard and immediately leaves.
    let a0 = groups[0].get_subgroup(subgroup).unwrap();
    let results = a0.ordered_query(PRINT, &()).unwrap();
    groups[0].leave();

    let replies = results.get().unwrap();
    for (node, value) in replies.iter() {
        assert_eq!(
            value,
            &Err(ReplyError::CallerRemoved),
            "entry for node {node} after leaving"
        );
    }

    // The survivors install a view without node 0; the shard re-forms over nodes
    // 1 and 2 and keeps delivering and answering queries.
    wait_until("view without node 0", Duration::from_secs(20), || {
        [1usize, 2].iter().all(|n| {
            groups[*n].members() == vec![NodeId::new(1), NodeId::new(2)]
        })
    });
    let a1 = groups[1].get_subgroup(subgroup).unwrap();
    let a2 = groups[2].get_subgroup(subgroup).unwrap();
    a1.ordered_send(APPEND, &String::from("after-1")).unwrap();
    a2.ordered_send(APPEND, &String::from("after-2")).unwrap();
    let expected = "after-1after-2";
    wait_until("survivor log convergence", Duration::from_secs(20), || {
        [1usize, 2].iter().all(|n| *logs[*n].lock().unwrap() == expected)
    });
    let results = a1.ordered_query(PRINT, &()).unwrap();
    let replies = results.get().unwrap();
    assert_eq!(replies.len(), 2);
    for n in [1u32, 2] {
        assert_eq!(
            replies.reply_as::<String>(NodeId::new(n)).unwrap(),
            expected
        );
    }
}

/// A node joins through the leader, receives the current object state before the
/// new view activates, and the view becomes adequate once the shard can be
/// provisioned.
#[test]
fn join_with_state_transfer() {
    setup_logger(LevelFilter::Warn);

    let ids = [0, 7];
    let fabrics = mock_fabric(&ids);
    let logs: Vec<Arc<Mutex<String>>> = (0..2).map(|_| Arc::new(Mutex::new(String::new()))).collect();

    // Node 0 founds alone; a two-member shard cannot be provisioned yet.
    let founder = {
        let log = logs[0].clone();
        GroupBuilder::new(config_for(0, false), fabrics[0].clone())
            .initial_members(endpoints_of(&[0]))
            .register_class(
                log_descriptor(),
                false,
                contiguous_shard(2),
                Box::new(move || Box::new(LogObject { log: log.clone() })),
            )
            .start()
    };
    wait_until("founder view", Duration::from_secs(10), || {
        founder.current_view().is_some()
    });
    assert!(matches!(
        founder.get_subgroup(SubgroupId::new(0)),
        Err(GroupError::InadequateView)
    ));

    // Node 7 joins via the founder.
    let joiner = {
        let log = logs[1].clone();
        GroupBuilder::new(config_for(7, false), fabrics[1].clone())
            .join_via(
                NodeId::new(0),
                Endpoints::new(Ipv4Addr::LOCALHOST, 23580, 23581, 23582, 23583),
            )
            .register_class(
                log_descriptor(),
                false,
                contiguous_shard(2),
                Box::new(move || Box::new(LogObject { log: log.clone() })),
            )
            .start()
    };

    wait_until("joined view on both nodes", Duration::from_secs(20), || {
        founder.members() == vec![NodeId::new(0), NodeId::new(7)]
            && joiner.members() == vec![NodeId::new(0), NodeId::new(7)]
    });
    wait_until("adequate view on both nodes", Duration::from_secs(10), || {
        founder.current_view().map(|v| v.adequate).unwrap_or(false)
            && joiner.current_view().map(|v| v.adequate).unwrap_or(false)
    });

    // Ordered traffic now flows through both members.
    let h0 = founder.get_subgroup(SubgroupId::new(0)).unwrap();
    h0.ordered_send(APPEND, &String::from("post-join")).unwrap();
    wait_until("delivery on the joiner", Duration::from_secs(20), || {
        *logs[1].lock().unwrap() == "post-join"
    });
}
