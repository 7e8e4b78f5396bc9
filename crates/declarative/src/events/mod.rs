//! Model lifecycle and attribute events.
//!
//! Listeners are plain closures receiving an [`EventContext`]. They are bound
//! to a mapper's [`EventDispatcher`] when the model is registered, either from
//! the model's `events` mapping or from [`EventDecorator`]s applied to its
//! methods, and can be added at runtime through [`Mapper::listen`].
//!
//! [`Mapper::listen`]: crate::mapper::Mapper::listen

pub mod decorator;
pub mod dispatcher;
pub mod registrar;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::event_error::EventError;
use crate::mapper::Mapper;
use crate::record::Record;
use crate::value::DatabaseValue;

pub use decorator::{
    after_delete, after_insert, after_update, append, attribute_event, before_delete,
    before_insert, before_update, expire, load, make_event_decorator, mapper_event, refresh,
    remove, set_, EventDecorator,
};
pub use dispatcher::EventDispatcher;

/// Prefix accepted (and stripped) on event names from older declarations.
pub const LEGACY_EVENT_PREFIX: &str = "on_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    Load,
    Refresh,
    Expire,
    Set,
    Append,
    Remove,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::BeforeInsert,
        EventKind::AfterInsert,
        EventKind::BeforeUpdate,
        EventKind::AfterUpdate,
        EventKind::BeforeDelete,
        EventKind::AfterDelete,
        EventKind::Load,
        EventKind::Refresh,
        EventKind::Expire,
        EventKind::Set,
        EventKind::Append,
        EventKind::Remove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BeforeInsert => "before_insert",
            EventKind::AfterInsert => "after_insert",
            EventKind::BeforeUpdate => "before_update",
            EventKind::AfterUpdate => "after_update",
            EventKind::BeforeDelete => "before_delete",
            EventKind::AfterDelete => "after_delete",
            EventKind::Load => "load",
            EventKind::Refresh => "refresh",
            EventKind::Expire => "expire",
            EventKind::Set => "set",
            EventKind::Append => "append",
            EventKind::Remove => "remove",
        }
    }

    /// Attribute events target a mapped attribute instead of the class.
    pub fn is_attribute_event(&self) -> bool {
        matches!(self, EventKind::Set | EventKind::Append | EventKind::Remove)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let bare = name.strip_prefix(LEGACY_EVENT_PREFIX).unwrap_or(name);
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == bare)
            .ok_or_else(|| {
                EventError::invalid_configuration(&format!("unknown event name '{}'", name))
            })
    }
}

/// Subscription options passed through to the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also bind to subclasses of the declaring model
    pub propagate: bool,
    /// `set` listeners may replace the incoming value
    pub retval: bool,
    /// Fire at most once
    pub once: bool,
    /// Run before listeners already bound
    pub insert: bool,
}

impl ListenOptions {
    pub fn propagate(mut self) -> Self {
        self.propagate = true;
        self
    }

    pub fn retval(mut self) -> Self {
        self.retval = true;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn insert(mut self) -> Self {
        self.insert = true;
        self
    }
}

/// Event-specific data handed to a listener.
pub enum EventPayload<'a> {
    /// Mapper and instance events
    Instance,
    /// Scalar attribute assignment; `value` may be rewritten by `retval` listeners
    Set {
        value: &'a mut DatabaseValue,
        old: &'a DatabaseValue,
    },
    /// Record appended to a collection
    Append { child: &'a mut Record },
    /// Record removed from a collection
    Remove { child: &'a Record },
}

pub struct EventContext<'a> {
    pub kind: EventKind,
    pub mapper: &'a Mapper,
    pub target: &'a mut Record,
    pub attribute: Option<&'a str>,
    pub payload: EventPayload<'a>,
}

impl<'a> EventContext<'a> {
    /// Incoming value of a `set` event.
    pub fn value(&self) -> Option<&DatabaseValue> {
        match &self.payload {
            EventPayload::Set { value, .. } => Some(&**value),
            _ => None,
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut DatabaseValue> {
        match &mut self.payload {
            EventPayload::Set { value, .. } => Some(&mut **value),
            _ => None,
        }
    }

    pub fn old_value(&self) -> Option<&DatabaseValue> {
        match &self.payload {
            EventPayload::Set { old, .. } => Some(*old),
            _ => None,
        }
    }

    /// Record appended or removed by a collection event.
    pub fn child(&self) -> Option<&Record> {
        match &self.payload {
            EventPayload::Append { child } => Some(&**child),
            EventPayload::Remove { child } => Some(*child),
            _ => None,
        }
    }
}

pub type ListenerFn = Arc<dyn Fn(&mut EventContext<'_>) -> Result<(), EventError> + Send + Sync>;

/// Wrap a closure as a listener.
pub fn listener<F>(f: F) -> ListenerFn
where
    F: Fn(&mut EventContext<'_>) -> Result<(), EventError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One subscription request, as collected at registration.
#[derive(Clone)]
pub struct EventSpec {
    pub names: Vec<String>,
    pub attribute: Option<String>,
    pub listener: ListenerFn,
    pub options: ListenOptions,
    /// Declared method the listener came from, if any
    pub origin: Option<String>,
}

impl fmt::Debug for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSpec")
            .field("names", &self.names)
            .field("attribute", &self.attribute)
            .field("options", &self.options)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Listener reference in a model's `events` mapping.
#[derive(Clone)]
pub enum ListenerRef {
    Callable(ListenerFn),
    /// Name of a method declared on the model itself
    Method(String),
}

#[derive(Clone)]
pub struct ListenerDecl {
    pub listener: ListenerRef,
    pub options: ListenOptions,
    pub attribute: Option<String>,
}

impl ListenerDecl {
    pub fn method(name: &str) -> Self {
        Self {
            listener: ListenerRef::Method(name.to_string()),
            options: ListenOptions::default(),
            attribute: None,
        }
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(&mut EventContext<'_>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        Self {
            listener: ListenerRef::Callable(Arc::new(f)),
            options: ListenOptions::default(),
            attribute: None,
        }
    }

    pub fn options(mut self, options: ListenOptions) -> Self {
        self.options = options;
        self
    }

    pub fn attribute(mut self, attribute: &str) -> Self {
        self.attribute = Some(attribute.to_string());
        self
    }
}

impl From<&str> for ListenerDecl {
    fn from(name: &str) -> Self {
        ListenerDecl::method(name)
    }
}

impl From<ListenerFn> for ListenerDecl {
    fn from(listener: ListenerFn) -> Self {
        Self {
            listener: ListenerRef::Callable(listener),
            options: ListenOptions::default(),
            attribute: None,
        }
    }
}

impl fmt::Debug for ListenerDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listener = match &self.listener {
            ListenerRef::Callable(_) => "<callable>".to_string(),
            ListenerRef::Method(name) => name.clone(),
        };
        f.debug_struct("ListenerDecl")
            .field("listener", &listener)
            .field("options", &self.options)
            .field("attribute", &self.attribute)
            .finish()
    }
}

/// A method declared on a model. Decorators attach event specs to it.
#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub handler: ListenerFn,
    pub events: Vec<EventSpec>,
}

impl Method {
    pub fn new<F>(name: &str, handler: F) -> Self
    where
        F: Fn(&mut EventContext<'_>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            handler: Arc::new(handler),
            events: Vec::new(),
        }
    }

    /// Apply an event decorator; the method itself is unchanged.
    pub fn listens(self, decorator: EventDecorator) -> Self {
        decorator.apply(self)
    }

    pub fn call(&self, ctx: &mut EventContext<'_>) -> Result<(), EventError> {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse_strips_legacy_prefix() {
        assert_eq!("before_insert".parse::<EventKind>().unwrap(), EventKind::BeforeInsert);
        assert_eq!("on_before_insert".parse::<EventKind>().unwrap(), EventKind::BeforeInsert);
        assert_eq!("on_set".parse::<EventKind>().unwrap(), EventKind::Set);
        assert!("before_frobnicate".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_kind_round_trip_names() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!(EventKind::Append.is_attribute_event());
        assert!(!EventKind::AfterUpdate.is_attribute_event());
    }

    #[test]
    fn test_listen_options_builder() {
        let options = ListenOptions::default().retval().once();
        assert!(options.retval);
        assert!(options.once);
        assert!(!options.propagate);
    }

    #[test]
    fn test_listener_decl_from_str() {
        let decl: ListenerDecl = "after_insert1".into();
        assert!(matches!(decl.listener, ListenerRef::Method(ref name) if name == "after_insert1"));
        assert!(decl.attribute.is_none());
    }
}
