//! Binds declared listeners to a mapper at registration.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::declarative::ModelDeclaration;
use crate::error::{ModelError, ModelResult};
use crate::events::{EventKind, EventSpec, ListenerRef};
use crate::mapper::Mapper;

/// Registered specs grouped by the event name they were declared under.
pub type EventRegistry = BTreeMap<String, Vec<EventSpec>>;

/// Collect the specs a declaration contributes: its `events` mapping
/// followed by the specs attached to its own methods.
fn declared_specs(decl: &ModelDeclaration) -> ModelResult<Vec<EventSpec>> {
    let mut specs = Vec::new();

    for (names, listeners) in &decl.events {
        for declared in listeners {
            let (listener, origin) = match &declared.listener {
                ListenerRef::Callable(listener) => (listener.clone(), None),
                ListenerRef::Method(method_name) => {
                    let method = decl
                        .methods
                        .iter()
                        .find(|m| &m.name == method_name)
                        .ok_or_else(|| {
                            ModelError::Configuration(format!(
                                "event listener '{}' is not a method declared on '{}'",
                                method_name, decl.name
                            ))
                        })?;
                    (method.handler.clone(), Some(method_name.clone()))
                }
            };
            specs.push(EventSpec {
                names: names.clone(),
                attribute: declared.attribute.clone(),
                listener,
                options: declared.options,
                origin,
            });
        }
    }

    for method in &decl.methods {
        specs.extend(method.events.iter().cloned());
    }

    Ok(specs)
}

pub(crate) fn validate_target(mapper: &Mapper, kind: EventKind, attribute: Option<&str>) -> ModelResult<()> {
    match (kind.is_attribute_event(), attribute) {
        (true, None) => Err(ModelError::Configuration(format!(
            "'{}' is an attribute event and needs an attribute on '{}'",
            kind,
            mapper.name()
        ))),
        (false, Some(attribute)) => Err(ModelError::Configuration(format!(
            "'{}' is a mapper event and cannot target attribute '{}'",
            kind, attribute
        ))),
        (false, None) => Ok(()),
        (true, Some(attribute)) => {
            let is_column = mapper.column(attribute).is_some();
            let relationship = mapper.relationship(attribute);
            let valid = match kind {
                EventKind::Set => is_column || relationship.is_some(),
                _ => relationship.map(|r| r.is_collection()).unwrap_or(false),
            };
            if valid {
                Ok(())
            } else {
                Err(ModelError::UnknownAttribute {
                    model: mapper.name().to_string(),
                    attribute: attribute.to_string(),
                })
            }
        }
    }
}

/// Bind every spec declared on the model, plus propagating specs from its
/// ancestors, and return the grouped record of what was bound.
pub(crate) fn register_events(
    mapper: &Mapper,
    mro: &[Arc<ModelDeclaration>],
) -> ModelResult<EventRegistry> {
    let decl = mapper.declaration();
    let mut specs = declared_specs(decl)?;

    for ancestor in mro.iter().skip(1) {
        specs.extend(
            declared_specs(ancestor)?
                .into_iter()
                .filter(|spec| spec.options.propagate),
        );
    }

    let mut registry = EventRegistry::new();
    for spec in specs {
        for name in &spec.names {
            let kind: EventKind = name.parse()?;
            let attribute = spec.attribute.as_deref();
            validate_target(mapper, kind, attribute)?;

            mapper
                .dispatcher()
                .listen(kind, attribute, spec.listener.clone(), spec.options);
            tracing::debug!(
                model = mapper.name(),
                event = %kind,
                attribute = attribute.unwrap_or(""),
                origin = spec.origin.as_deref().unwrap_or("<callable>"),
                "bound event listener"
            );

            registry.entry(name.clone()).or_default().push(spec.clone());
        }
    }

    Ok(registry)
}
