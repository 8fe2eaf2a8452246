/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persistence hook.
//!
//! Every delivery in a persistent subgroup produces a dense, monotone version:
//! `(subgroup, version, hlc, state bytes)`. The delivery thread appends the record
//! to the in-memory [`VersionLog`] and hands it to the persistence thread, which
//! drains records into the embedder's [`DurableStore`] and reports the durable
//! frontier back so the table's `persisted_num` column can advance. Persistence
//! failures are observable as `persisted_num` lagging `delivered_num`; they never
//! roll back delivery.
//!
//! The log answers version-indexed reads directly and time-indexed reads through a
//! temporal frontier: `read_by_time` returns the state immediately preceding the
//! requested instant, and fails with [`GroupError::TimestampBeyondFrontier`] if the
//! instant is past the most recent globally-stable timestamp (a caller that wants a
//! fresh read waits for the frontier to advance).

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::GroupError;
use crate::types::basic::{SeqNum, SubgroupId, Version, Vid};
use crate::types::hlc::HlcTimestamp;

/// One delivered version of a subgroup's replicated state.
#[derive(Clone, Debug)]
pub struct VersionRecord {
    pub version: Version,
    /// The delivery sequence number the version was assigned at.
    pub seq: SeqNum,
    pub hlc: HlcTimestamp,
    /// Serialized object state after applying the delivery.
    pub state: Vec<u8>,
}

/// The durability collaborator: accepts version records and later reports the
/// highest version known persisted.
pub trait DurableStore: Send + 'static {
    fn persist(
        &mut self,
        subgroup: SubgroupId,
        record: &VersionRecord,
    ) -> Result<(), std::io::Error>;

    fn highest_persisted(&self, subgroup: SubgroupId) -> Option<Version>;
}

impl DurableStore for Box<dyn DurableStore> {
    fn persist(
        &mut self,
        subgroup: SubgroupId,
        record: &VersionRecord,
    ) -> Result<(), std::io::Error> {
        (**self).persist(subgroup, record)
    }

    fn highest_persisted(&self, subgroup: SubgroupId) -> Option<Version> {
        (**self).highest_persisted(subgroup)
    }
}

/// An in-memory durable store, for tests and volatile deployments.
#[derive(Clone, Default)]
pub struct MemoryStore {
    persisted: Arc<Mutex<HashMap<SubgroupId, Vec<VersionRecord>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl DurableStore for MemoryStore {
    fn persist(
        &mut self,
        subgroup: SubgroupId,
        record: &VersionRecord,
    ) -> Result<(), std::io::Error> {
        self.persisted
            .lock()
            .unwrap()
            .entry(subgroup)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn highest_persisted(&self, subgroup: SubgroupId) -> Option<Version> {
        self.persisted
            .lock()
            .unwrap()
            .get(&subgroup)
            .and_then(|records| records.last())
            .map(|r| r.version)
    }
}

struct SubgroupLog {
    records: Vec<VersionRecord>,
    /// The view each record was delivered in. Sequence numbers restart per view, so
    /// stability advances are matched against the view they speak about.
    vids: Vec<Vid>,
    /// Count of leading records known received by every shard member. The temporal
    /// frontier is the timestamp of the last such record.
    stable_upto: usize,
}

/// The version history of every persistent subgroup on this node, shared between
/// the delivery thread (appends), the core thread (stability advances) and readers.
#[derive(Clone)]
pub struct VersionLog {
    inner: Arc<Mutex<HashMap<SubgroupId, SubgroupLog>>>,
}

impl VersionLog {
    pub fn new() -> VersionLog {
        VersionLog {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Assign and append the next version for a delivery. Returns the version.
    pub fn append(
        &self,
        subgroup: SubgroupId,
        vid: Vid,
        seq: SeqNum,
        hlc: HlcTimestamp,
        state: Vec<u8>,
    ) -> VersionRecord {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.entry(subgroup).or_insert_with(new_subgroup_log);
        let version = Version::new(log.records.len() as i64);
        let record = VersionRecord {
            version,
            seq,
            hlc,
            state,
        };
        log.records.push(record.clone());
        log.vids.push(vid);
        record
    }

    /// Advance the globally-stable frontier of a subgroup: every record of the
    /// given view with a sequence number at or below `stable` is known received by
    /// every shard member.
    pub fn advance_stable(&self, subgroup: SubgroupId, vid: Vid, stable: SeqNum) {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.entry(subgroup).or_insert_with(new_subgroup_log);
        while log.stable_upto < log.records.len()
            && log.vids[log.stable_upto] == vid
            && log.records[log.stable_upto].seq <= stable
        {
            log.stable_upto += 1;
        }
    }

    /// A view change delivered everything of the old view that ever will be: the
    /// whole existing history becomes stable.
    pub fn seal(&self, subgroup: SubgroupId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(log) = inner.get_mut(&subgroup) {
            log.stable_upto = log.records.len();
        }
    }

    pub fn latest_version(&self, subgroup: SubgroupId) -> Option<Version> {
        self.inner
            .lock()
            .unwrap()
            .get(&subgroup)
            .and_then(|log| log.records.last())
            .map(|r| r.version)
    }

    /// State at an exact version.
    pub fn read(&self, subgroup: SubgroupId, version: Version) -> Result<Vec<u8>, GroupError> {
        self.inner
            .lock()
            .unwrap()
            .get(&subgroup)
            .and_then(|log| log.records.get(version.int() as usize))
            .map(|r| r.state.clone())
            .ok_or(GroupError::UnknownVersion(version))
    }

    /// State as of a wall-clock instant: the latest version whose timestamp is not
    /// after `at`. Fails if `at` lies beyond the temporal frontier — the timestamp
    /// of the most recent globally-stable version — because deliveries with earlier
    /// timestamps could still arrive.
    pub fn read_by_time(
        &self,
        subgroup: SubgroupId,
        at: HlcTimestamp,
    ) -> Result<Vec<u8>, GroupError> {
        let inner = self.inner.lock().unwrap();
        let log = inner
            .get(&subgroup)
            .ok_or(GroupError::TimestampBeyondFrontier {
                requested: at,
                frontier: HlcTimestamp::epoch(),
            })?;
        let frontier = log.records[..log.stable_upto]
            .last()
            .map(|r| r.hlc)
            .unwrap_or_else(HlcTimestamp::epoch);
        if at > frontier {
            return Err(GroupError::TimestampBeyondFrontier {
                requested: at,
                frontier,
            });
        }
        log.records
            .iter()
            .take_while(|r| r.hlc <= at)
            .last()
            .map(|r| r.state.clone())
            .ok_or(GroupError::TimestampBeyondFrontier {
                requested: at,
                frontier,
            })
    }

    /// Drop the history of a subgroup torn down on this node.
    pub fn forget(&self, subgroup: SubgroupId) {
        self.inner.lock().unwrap().remove(&subgroup);
    }
}

impl Default for VersionLog {
    fn default() -> Self {
        Self::new()
    }
}

fn new_subgroup_log() -> SubgroupLog {
    SubgroupLog {
        records: Vec::new(),
        vids: Vec::new(),
        stable_upto: 0,
    }
}

/// Sent from the persistence thread back to the core thread when a version has been
/// made durable, so `persisted_num` can advance in the table.
#[derive(Clone, Copy, Debug)]
pub struct PersistedNotice {
    pub subgroup: SubgroupId,
    pub seq: SeqNum,
    pub version: Version,
}

/// Spawn the persistence thread: drains the delivery-to-persistence queue into the
/// durable store and reports durable frontiers to the core thread.
pub(crate) fn start_persistence<S, E>(
    mut store: S,
    records: Receiver<(SubgroupId, VersionRecord)>,
    core: Sender<E>,
) -> JoinHandle<()>
where
    S: DurableStore,
    E: From<PersistedNotice> + Send + 'static,
{
    thread::Builder::new()
        .name(String::from("groupcast-persistence"))
        .spawn(move || loop {
            match records.recv_timeout(Duration::from_millis(100)) {
                Ok((subgroup, record)) => match store.persist(subgroup, &record) {
                    Ok(()) => {
                        let notice = PersistedNotice {
                            subgroup,
                            seq: record.seq,
                            version: record.version,
                        };
                        if core.send(E::from(notice)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // Delivery is never rolled back; the lag between
                        // persisted_num and delivered_num is the observable signal.
                        log::error!(
                            "failed to persist version {} of subgroup {subgroup}: {e}",
                            record.version
                        );
                    }
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .expect("spawning the persistence thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(micros: u64) -> HlcTimestamp {
        HlcTimestamp::new(micros, 0)
    }

    #[test]
    fn versions_are_dense_and_readable() {
        let log = VersionLog::new();
        let sg = SubgroupId::new(0);
        for i in 0..3 {
            let record = log.append(
                sg,
                Vid::init(),
                SeqNum::new(i),
                stamped(10 + i as u64),
                vec![i as u8],
            );
            assert_eq!(record.version, Version::new(i));
        }
        assert_eq!(log.latest_version(sg), Some(Version::new(2)));
        assert_eq!(log.read(sg, Version::new(1)).unwrap(), vec![1]);
        assert!(matches!(
            log.read(sg, Version::new(7)),
            Err(GroupError::UnknownVersion(_))
        ));
    }

    #[test]
    fn read_by_time_is_gated_by_the_stable_frontier() {
        let log = VersionLog::new();
        let sg = SubgroupId::new(0);
        log.append(sg, Vid::init(), SeqNum::new(0), stamped(100), vec![0]);
        log.append(sg, Vid::init(), SeqNum::new(1), stamped(200), vec![1]);

        // Nothing is globally stable yet: every read is beyond the frontier.
        assert!(matches!(
            log.read_by_time(sg, stamped(150)),
            Err(GroupError::TimestampBeyondFrontier { .. })
        ));

        log.advance_stable(sg, Vid::init(), SeqNum::new(0));
        assert_eq!(log.read_by_time(sg, stamped(100)).unwrap(), vec![0]);
        assert!(matches!(
            log.read_by_time(sg, stamped(250)),
            Err(GroupError::TimestampBeyondFrontier { .. })
        ));

        log.advance_stable(sg, Vid::init(), SeqNum::new(1));
        assert_eq!(log.read_by_time(sg, stamped(250)).unwrap(), vec![1]);
        assert_eq!(log.read_by_time(sg, stamped(150)).unwrap(), vec![0]);
    }

    #[test]
    fn stability_does_not_leak_across_views() {
        let log = VersionLog::new();
        let sg = SubgroupId::new(0);
        log.append(sg, Vid::init(), SeqNum::new(7), stamped(100), vec![0]);
        log.advance_stable(sg, Vid::init(), SeqNum::new(7));

        // The next view restarts the encoding; its first record is not stable just
        // because the old view's frontier was higher.
        log.append(sg, Vid::new(1), SeqNum::new(0), stamped(200), vec![1]);
        log.advance_stable(sg, Vid::init(), SeqNum::new(7));
        assert_eq!(log.read_by_time(sg, stamped(150)).unwrap(), vec![0]);
        assert!(matches!(
            log.read_by_time(sg, stamped(200)),
            Err(GroupError::TimestampBeyondFrontier { .. })
        ));

        log.advance_stable(sg, Vid::new(1), SeqNum::new(0));
        assert_eq!(log.read_by_time(sg, stamped(200)).unwrap(), vec![1]);
    }

    #[test]
    fn memory_store_reports_the_durable_frontier() {
        let mut store = MemoryStore::new();
        let sg = SubgroupId::new(3);
        assert_eq!(store.highest_persisted(sg), None);
        store
            .persist(
                sg,
                &VersionRecord {
                    version: Version::new(0),
                    seq: SeqNum::new(0),
                    hlc: stamped(1),
                    state: vec![],
                },
            )
            .unwrap();
        assert_eq!(store.highest_persisted(sg), Some(Version::new(0)));
    }
}
