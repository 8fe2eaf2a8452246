/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Named row-level conditions over the shared state table.
//!
//! A predicate is registered with a kind: a `Recurrent` predicate fires on every
//! table change where its condition holds, a `OneTime` predicate fires at most once
//! and is then dropped. All predicates are evaluated on the single core thread, in
//! registration order, after each batch of table changes; the registered action is a
//! plain token the caller dispatches on, so an action may mutate the local row and
//! publish further writes but can never block on another predicate.

use super::SharedStateTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateKind {
    /// Fires at most once, then is deregistered automatically.
    OneTime,
    /// Fires on every evaluation where the condition holds.
    Recurrent,
}

/// Handle returned by registration, usable for deregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredicateHandle(u64);

type PredicateFn = Box<dyn FnMut(&SharedStateTable) -> bool + Send>;

struct Entry<A> {
    handle: PredicateHandle,
    name: &'static str,
    kind: PredicateKind,
    predicate: PredicateFn,
    action: A,
}

/// The predicate registry for one table instance, parameterized over the action
/// token type.
pub struct Predicates<A: Copy> {
    next_handle: u64,
    entries: Vec<Entry<A>>,
}

impl<A: Copy> Predicates<A> {
    pub fn new() -> Predicates<A> {
        Predicates {
            next_handle: 0,
            entries: Vec::new(),
        }
    }

    /// Register a named condition. Returns a handle for later deregistration.
    pub fn register(
        &mut self,
        name: &'static str,
        kind: PredicateKind,
        predicate: PredicateFn,
        action: A,
    ) -> PredicateHandle {
        let handle = PredicateHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(Entry {
            handle,
            name,
            kind,
            predicate,
            action,
        });
        handle
    }

    pub fn deregister(&mut self, handle: PredicateHandle) {
        self.entries.retain(|e| e.handle != handle);
    }

    /// Evaluate every registered predicate against the table, in registration order,
    /// and return the action tokens of those that fired. One-time predicates that
    /// fired are dropped.
    pub fn evaluate(&mut self, table: &SharedStateTable) -> Vec<A> {
        let mut fired = Vec::new();
        let mut spent = Vec::new();
        for entry in self.entries.iter_mut() {
            if (entry.predicate)(table) {
                log::trace!("predicate {} fired", entry.name);
                fired.push(entry.action);
                if entry.kind == PredicateKind::OneTime {
                    spent.push(entry.handle);
                }
            }
        }
        for handle in spent {
            self.deregister(handle);
        }
        fired
    }
}

impl<A: Copy> Default for Predicates<A> {
    fn default() -> Self {
        Self::new()
    }
}
