// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Process-wide publish/subscribe for trace events.
//!
//! Emission order is FIFO across all subscribers. A subscriber that emits
//! events from inside its callback does not recurse: re-entrant emission on
//! the same thread is dropped by the `EMITTING` guard. Subscribers must not
//! mutate the bus from inside a callback.

pub mod filter;
pub mod logger;

use std::cell::Cell;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::event::TraceEvent;

type SubscriberFn = Box<dyn FnMut(&TraceEvent) + Send>;

/// Token returned by [`subscribe`]; pass it to [`unsubscribe`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubscriberId(u64);

struct Bus {
    next_id: u64,
    subscribers: Vec<(u64, SubscriberFn)>,
}

static BUS: Lazy<Mutex<Bus>> = Lazy::new(|| {
    Mutex::new(Bus {
        next_id: 0,
        subscribers: Vec::new(),
    })
});

thread_local! {
    static EMITTING: Cell<bool> = Cell::new(false);
}

/// Register a subscriber. It receives every event emitted after this call
/// until it is unsubscribed.
pub fn subscribe(subscriber: SubscriberFn) -> SubscriberId {
    let mut bus = BUS.lock();
    let id = bus.next_id;
    bus.next_id += 1;
    bus.subscribers.push((id, subscriber));
    SubscriberId(id)
}

/// Remove a subscriber. It must not receive any subsequent event.
pub fn unsubscribe(id: SubscriberId) {
    BUS.lock().subscribers.retain(|(sid, _)| *sid != id.0);
}

/// Deliver an event to every subscriber, in registration order. Re-entrant
/// emission from a subscriber callback is ignored.
pub fn emit(event: TraceEvent) {
    let entered = EMITTING.with(|flag| {
        if flag.get() {
            false
        } else {
            flag.set(true);
            true
        }
    });
    if !entered {
        return;
    }
    let _reset = crate::scope::guard::OnDrop::run_on_drop(|| {
        EMITTING.with(|flag| flag.set(false));
    });

    let mut bus = BUS.lock();
    for (_, subscriber) in bus.subscribers.iter_mut() {
        subscriber(&event);
    }
}
