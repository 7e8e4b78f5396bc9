//! Event decorators for model methods.
//!
//! ```ignore
//! let method = Method::new("stamp", |ctx| { /* ... */ Ok(()) })
//!     .listens(before_insert())
//!     .listens(set_("name").options(ListenOptions::default().retval()));
//! ```

use crate::events::{EventKind, EventSpec, ListenOptions, Method};

/// Records one subscription request on the method it is applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDecorator {
    names: Vec<String>,
    attribute: Option<String>,
    options: ListenOptions,
}

impl EventDecorator {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            attribute: None,
            options: ListenOptions::default(),
        }
    }

    pub fn attribute(mut self, attribute: &str) -> Self {
        self.attribute = Some(attribute.to_string());
        self
    }

    pub fn options(mut self, options: ListenOptions) -> Self {
        self.options = options;
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Append an event spec to the method and hand it back.
    pub fn apply(self, mut method: Method) -> Method {
        method.events.push(EventSpec {
            names: self.names,
            attribute: self.attribute,
            listener: method.handler.clone(),
            options: self.options,
            origin: Some(method.name.clone()),
        });
        method
    }
}

/// Decorator for one or more event names with an optional attribute target.
pub fn make_event_decorator<I, S>(names: I, attribute: Option<&str>, options: ListenOptions) -> EventDecorator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let decorator = EventDecorator::new(names).options(options);
    match attribute {
        Some(attribute) => decorator.attribute(attribute),
        None => decorator,
    }
}

/// Class-level event decorator.
pub fn mapper_event<I, S>(names: I) -> EventDecorator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    EventDecorator::new(names)
}

/// Attribute event decorator.
pub fn attribute_event<I, S>(names: I, attribute: &str) -> EventDecorator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    EventDecorator::new(names).attribute(attribute)
}

fn single(kind: EventKind) -> EventDecorator {
    EventDecorator::new([kind.as_str()])
}

pub fn before_insert() -> EventDecorator {
    single(EventKind::BeforeInsert)
}

pub fn after_insert() -> EventDecorator {
    single(EventKind::AfterInsert)
}

pub fn before_update() -> EventDecorator {
    single(EventKind::BeforeUpdate)
}

pub fn after_update() -> EventDecorator {
    single(EventKind::AfterUpdate)
}

pub fn before_delete() -> EventDecorator {
    single(EventKind::BeforeDelete)
}

pub fn after_delete() -> EventDecorator {
    single(EventKind::AfterDelete)
}

pub fn load() -> EventDecorator {
    single(EventKind::Load)
}

pub fn refresh() -> EventDecorator {
    single(EventKind::Refresh)
}

pub fn expire() -> EventDecorator {
    single(EventKind::Expire)
}

/// `set` on a scalar attribute. Named with a trailing underscore to leave
/// `set` free for setters.
pub fn set_(attribute: &str) -> EventDecorator {
    single(EventKind::Set).attribute(attribute)
}

pub fn append(attribute: &str) -> EventDecorator {
    single(EventKind::Append).attribute(attribute)
}

pub fn remove(attribute: &str) -> EventDecorator {
    single(EventKind::Remove).attribute(attribute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decorator_appends_spec_and_keeps_method() {
        let method = Method::new("stamp", |_ctx| Ok(()))
            .listens(before_insert())
            .listens(before_update());

        assert_eq!(method.name, "stamp");
        assert_eq!(method.events.len(), 2);
        assert_eq!(method.events[0].names, vec!["before_insert".to_string()]);
        assert_eq!(method.events[1].names, vec!["before_update".to_string()]);
        assert_eq!(method.events[0].origin.as_deref(), Some("stamp"));
    }

    #[test]
    fn test_multiple_names_and_attribute() {
        let decorator = make_event_decorator(
            ["append", "remove"],
            Some("bars"),
            ListenOptions::default().propagate(),
        );
        let method = Method::new("track", |_ctx| Ok(())).listens(decorator);

        let spec = &method.events[0];
        assert_eq!(spec.names, vec!["append".to_string(), "remove".to_string()]);
        assert_eq!(spec.attribute.as_deref(), Some("bars"));
        assert!(spec.options.propagate);
    }

    #[test]
    fn test_attribute_helpers() {
        let decorator = set_("string");
        assert_eq!(decorator.names(), &["set".to_string()]);
        assert_eq!(decorator, attribute_event(["set"], "string"));
    }
}
