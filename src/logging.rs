/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Default logging handlers for runtime events.
//!
//! Events are logged through the [log](https://docs.rs/log/latest/log/) crate; to get
//! the messages printed onto a terminal or to a file, set up a logging
//! implementation. The default handlers are enabled per group via
//! [`Configuration::log_events`](crate::config::Configuration).
//!
//! Log messages are CSVs with at least two values. The first two are always the
//! event name in PascalCase and the time the event was emitted (seconds since the
//! Unix epoch); the rest differ by event. For example, a delivery prints as:
//!
//! ```text
//! Deliver, 1701329264, 2, 40, 17
//! ```
//!
//! where the third value is the subgroup, the fourth the sender id, and the fifth
//! the sequence number.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::events::*;

pub const VIEW_INSTALLED: &str = "ViewInstalled";
pub const SUSPECT: &str = "Suspect";
pub const PROPOSE_CHANGE: &str = "ProposeChange";
pub const WEDGE: &str = "Wedge";
pub const DELIVER: &str = "Deliver";
pub const PERSISTED: &str = "Persisted";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Logger for ViewInstalledEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewInstalledEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                VIEW_INSTALLED,
                secs_since_unix_epoch(event.timestamp),
                event.vid,
                event.members.len(),
                event.joined.len(),
                event.departed.len(),
            )
        })
    }
}

impl Logger for SuspectEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SuspectEvent| {
            log::info!(
                "{}, {}, {}",
                SUSPECT,
                secs_since_unix_epoch(event.timestamp),
                event.suspect,
            )
        })
    }
}

impl Logger for ProposeChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.node,
                event.is_join,
                event.num_changes,
            )
        })
    }
}

impl Logger for WedgeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &WedgeEvent| {
            log::info!(
                "{}, {}, {}",
                WEDGE,
                secs_since_unix_epoch(event.timestamp),
                event.vid,
            )
        })
    }
}

impl Logger for DeliverEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &DeliverEvent| {
            log::trace!(
                "{}, {}, {}, {}, {}",
                DELIVER,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup,
                event.sender,
                event.seq,
            )
        })
    }
}

impl Logger for PersistedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PersistedEvent| {
            log::trace!(
                "{}, {}, {}, {}",
                PERSISTED,
                secs_since_unix_epoch(event.timestamp),
                event.subgroup,
                event.version,
            )
        })
    }
}
