/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Group membership: views, subgroup allocation, and the group management service.
//!
//! [`view`] defines the [`View`](view::View) installed at every membership change and
//! the per-shard [`SubView`](view::SubView)s cut from it. [`allocation`] defines the
//! deterministic function that lays subgroups and shards out over a view's members.
//! [`gms`] is the service itself: it watches the shared state table for suspicions,
//! runs the proposal → commit → wedge → install state machine, and drives joining
//! nodes through state transfer.

pub mod allocation;

pub mod gms;

pub mod view;
