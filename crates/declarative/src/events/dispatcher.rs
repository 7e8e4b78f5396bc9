//! Per-mapper listener storage and dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::event_error::EventError;
use crate::events::{EventContext, EventKind, EventPayload, ListenOptions, ListenerFn};
use crate::mapper::Mapper;
use crate::record::Record;
use crate::value::DatabaseValue;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

struct Subscription {
    id: u64,
    kind: EventKind,
    attribute: Option<String>,
    listener: ListenerFn,
    options: ListenOptions,
    fired: AtomicBool,
}

impl Subscription {
    /// False once a `once` listener has already run.
    fn arm(&self) -> bool {
        !(self.options.once && self.fired.swap(true, Ordering::SeqCst))
    }
}

/// Listeners bound to one mapper.
///
/// Dispatch snapshots the matching listeners before calling them, so a
/// listener may add or remove subscriptions while running.
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener; returns an id usable with [`remove`](Self::remove).
    pub fn listen(
        &self,
        kind: EventKind,
        attribute: Option<&str>,
        listener: ListenerFn,
        options: ListenOptions,
    ) -> u64 {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            kind,
            attribute: attribute.map(str::to_string),
            listener,
            options,
            fired: AtomicBool::new(false),
        });

        let mut subscriptions = self.subscriptions.write();
        if options.insert {
            subscriptions.insert(0, subscription);
        } else {
            subscriptions.push(subscription);
        }
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    pub fn contains(&self, kind: EventKind, attribute: Option<&str>) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|s| s.kind == kind && s.attribute.as_deref() == attribute)
    }

    /// Number of bound listeners for an event.
    pub fn count(&self, kind: EventKind, attribute: Option<&str>) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.kind == kind && s.attribute.as_deref() == attribute)
            .count()
    }

    fn matching(&self, kind: EventKind, attribute: Option<&str>) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.kind == kind && s.attribute.as_deref() == attribute)
            .cloned()
            .collect()
    }

    pub(crate) fn dispatch_instance(
        &self,
        kind: EventKind,
        mapper: &Mapper,
        target: &mut Record,
    ) -> Result<(), EventError> {
        for subscription in self.matching(kind, None) {
            if !subscription.arm() {
                continue;
            }
            let mut ctx = EventContext {
                kind,
                mapper,
                target: &mut *target,
                attribute: None,
                payload: EventPayload::Instance,
            };
            (subscription.listener)(&mut ctx)?;
        }
        Ok(())
    }

    /// Run `set` listeners. Only `retval` listeners can change `value`.
    pub(crate) fn dispatch_set(
        &self,
        mapper: &Mapper,
        target: &mut Record,
        attribute: &str,
        value: &mut DatabaseValue,
        old: &DatabaseValue,
    ) -> Result<(), EventError> {
        for subscription in self.matching(EventKind::Set, Some(attribute)) {
            if !subscription.arm() {
                continue;
            }
            let mut scratch;
            let value_ref: &mut DatabaseValue = if subscription.options.retval {
                &mut *value
            } else {
                scratch = value.clone();
                &mut scratch
            };
            let mut ctx = EventContext {
                kind: EventKind::Set,
                mapper,
                target: &mut *target,
                attribute: Some(attribute),
                payload: EventPayload::Set { value: value_ref, old },
            };
            (subscription.listener)(&mut ctx)?;
        }
        Ok(())
    }

    pub(crate) fn dispatch_append(
        &self,
        mapper: &Mapper,
        target: &mut Record,
        attribute: &str,
        child: &mut Record,
    ) -> Result<(), EventError> {
        for subscription in self.matching(EventKind::Append, Some(attribute)) {
            if !subscription.arm() {
                continue;
            }
            let mut ctx = EventContext {
                kind: EventKind::Append,
                mapper,
                target: &mut *target,
                attribute: Some(attribute),
                payload: EventPayload::Append { child: &mut *child },
            };
            (subscription.listener)(&mut ctx)?;
        }
        Ok(())
    }

    pub(crate) fn dispatch_remove(
        &self,
        mapper: &Mapper,
        target: &mut Record,
        attribute: &str,
        child: &Record,
    ) -> Result<(), EventError> {
        for subscription in self.matching(EventKind::Remove, Some(attribute)) {
            if !subscription.arm() {
                continue;
            }
            let mut ctx = EventContext {
                kind: EventKind::Remove,
                mapper,
                target: &mut *target,
                attribute: Some(attribute),
                payload: EventPayload::Remove { child },
            };
            (subscription.listener)(&mut ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions = self.subscriptions.read();
        let summary: Vec<String> = subscriptions
            .iter()
            .map(|s| match &s.attribute {
                Some(attribute) => format!("{}:{}", s.kind, attribute),
                None => s.kind.to_string(),
            })
            .collect();
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &summary)
            .finish()
    }
}
