/*
    Copyright © 2024, Groupcast Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the runtime's threads and passes them to
//! event handlers.
//!
//! A group's instance of [`EventHandlers`] contains the handlers provided when the
//! group was built and, if logging is enabled, the default CSV logging handlers
//! defined in [`logging`](crate::logging). When no handlers are present the thread
//! is not started.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

/// Pointer to a handler closure, parameterized by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// The two optional handlers enabled for one event type: one user-defined, one
/// default logging handler.
pub(crate) struct HandlerPair<T: Logger> {
    user_defined: Option<HandlerPtr<T>>,
    logging: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    pub(crate) fn new(log: bool, user_defined: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined,
            logging: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn is_empty(&self) -> bool {
        self.user_defined.is_none() && self.logging.is_none()
    }

    fn fire(&self, event: &T) {
        if let Some(handler) = &self.logging {
            handler(event)
        }
        if let Some(handler) = &self.user_defined {
            handler(event)
        }
    }
}

/// The handler pairs for every pre-defined event type.
pub(crate) struct EventHandlers {
    pub(crate) view_installed: HandlerPair<ViewInstalledEvent>,
    pub(crate) suspect: HandlerPair<SuspectEvent>,
    pub(crate) propose_change: HandlerPair<ProposeChangeEvent>,
    pub(crate) wedge: HandlerPair<WedgeEvent>,
    pub(crate) deliver: HandlerPair<DeliverEvent>,
    pub(crate) persisted: HandlerPair<PersistedEvent>,
}

impl EventHandlers {
    pub(crate) fn is_empty(&self) -> bool {
        self.view_installed.is_empty()
            && self.suspect.is_empty()
            && self.propose_change.is_empty()
            && self.wedge.is_empty()
            && self.deliver.is_empty()
            && self.persisted.is_empty()
    }

    fn fire(&self, event: &Event) {
        match event {
            Event::ViewInstalled(e) => self.view_installed.fire(e),
            Event::Suspect(e) => self.suspect.fire(e),
            Event::ProposeChange(e) => self.propose_change.fire(e),
            Event::Wedge(e) => self.wedge.fire(e),
            Event::Deliver(e) => self.deliver.fire(e),
            Event::Persisted(e) => self.persisted.fire(e),
        }
    }
}

/// Spawn the event bus thread. Exits when every sender side of the channel is gone.
pub(crate) fn start_event_bus(
    handlers: EventHandlers,
    events: Receiver<Event>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(String::from("groupcast-event-bus"))
        .spawn(move || loop {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => handlers.fire(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
        .expect("spawning the event bus thread")
}
