//! Merging of inherited table and mapper arguments.
//!
//! Each class in a model's ancestry may carry a *global* fragment (inherited
//! by subclasses) and a *local* fragment (applies to that class only). A
//! fragment is either a keyword map, a sequence of positional items with an
//! optional trailing keyword map, or a deferred producer of one of those.
//!
//! Merging walks the ancestry from the most basic class to the most derived
//! one: keyword maps are folded left to right so later keys win, positional
//! items are concatenated and deduplicated keeping the first occurrence.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::declarative::ModelDeclaration;
use crate::error::{ModelError, ModelResult};

/// Keyword arguments
pub type ArgOptions = BTreeMap<String, JsonValue>;

/// One element of a sequence fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentEntry<T> {
    Arg(T),
    Options(ArgOptions),
}

pub type DeclaredFragment<T> = Arc<dyn Fn(&ModelDeclaration) -> ConfigFragment<T> + Send + Sync>;
pub type CallableFragment<T> = Arc<dyn Fn() -> ConfigFragment<T> + Send + Sync>;

/// A configuration fragment declared on one class of the ancestry.
#[derive(Clone)]
pub enum ConfigFragment<T> {
    Map(ArgOptions),
    Sequence(Vec<FragmentEntry<T>>),
    /// Evaluated against the class under construction
    Declared(DeclaredFragment<T>),
    /// Evaluated with no arguments
    Callable(CallableFragment<T>),
}

impl<T> ConfigFragment<T> {
    pub fn map(options: ArgOptions) -> Self {
        ConfigFragment::Map(options)
    }

    pub fn sequence<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        ConfigFragment::Sequence(items.into_iter().map(FragmentEntry::Arg).collect())
    }

    /// Positional items followed by a trailing keyword map.
    pub fn with_options<I>(items: I, options: ArgOptions) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let mut entries: Vec<FragmentEntry<T>> = items.into_iter().map(FragmentEntry::Arg).collect();
        entries.push(FragmentEntry::Options(options));
        ConfigFragment::Sequence(entries)
    }

    pub fn declared<F>(producer: F) -> Self
    where
        F: Fn(&ModelDeclaration) -> ConfigFragment<T> + Send + Sync + 'static,
    {
        ConfigFragment::Declared(Arc::new(producer))
    }

    pub fn callable<F>(producer: F) -> Self
    where
        F: Fn() -> ConfigFragment<T> + Send + Sync + 'static,
    {
        ConfigFragment::Callable(Arc::new(producer))
    }
}

impl<T: Clone> ConfigFragment<T> {
    /// Evaluate deferred producers until a concrete fragment remains.
    pub fn resolve(&self, cls: &ModelDeclaration) -> ConfigFragment<T> {
        let mut current = self.clone();
        loop {
            current = match current {
                ConfigFragment::Declared(producer) => producer(cls),
                ConfigFragment::Callable(producer) => producer(),
                concrete => return concrete,
            };
        }
    }

    /// Empty maps and sequences contribute nothing.
    pub fn is_empty(&self) -> bool {
        match self {
            ConfigFragment::Map(options) => options.is_empty(),
            ConfigFragment::Sequence(entries) => entries.is_empty(),
            ConfigFragment::Declared(_) | ConfigFragment::Callable(_) => false,
        }
    }

    /// Split a concrete fragment into positional items and keyword options.
    pub fn classify(self) -> ModelResult<(Vec<T>, ArgOptions)> {
        match self {
            ConfigFragment::Map(options) => Ok((Vec::new(), options)),
            ConfigFragment::Sequence(mut entries) => {
                let options = match entries.last() {
                    Some(FragmentEntry::Options(_)) => match entries.pop() {
                        Some(FragmentEntry::Options(options)) => options,
                        _ => ArgOptions::new(),
                    },
                    _ => ArgOptions::new(),
                };
                let mut positional = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        FragmentEntry::Arg(item) => positional.push(item),
                        FragmentEntry::Options(_) => {
                            return Err(ModelError::Configuration(
                                "keyword options are only allowed as the last element of an argument sequence"
                                    .to_string(),
                            ))
                        }
                    }
                }
                Ok((positional, options))
            }
            ConfigFragment::Declared(_) | ConfigFragment::Callable(_) => Err(
                ModelError::Configuration("deferred argument fragment was not resolved".to_string()),
            ),
        }
    }
}

impl<T> From<ArgOptions> for ConfigFragment<T> {
    fn from(options: ArgOptions) -> Self {
        ConfigFragment::Map(options)
    }
}

impl<T> From<Vec<T>> for ConfigFragment<T> {
    fn from(items: Vec<T>) -> Self {
        ConfigFragment::sequence(items)
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigFragment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFragment::Map(options) => f.debug_tuple("Map").field(options).finish(),
            ConfigFragment::Sequence(entries) => f.debug_tuple("Sequence").field(entries).finish(),
            ConfigFragment::Declared(_) => f.write_str("Declared(..)"),
            ConfigFragment::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

/// The normalized `(positional, keyword)` pair produced by merging.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedArgs<T> {
    pub positional: Vec<T>,
    pub options: ArgOptions,
}

impl<T> Default for MergedArgs<T> {
    fn default() -> Self {
        Self {
            positional: Vec::new(),
            options: ArgOptions::new(),
        }
    }
}

impl<T: Clone + PartialEq> MergedArgs<T> {
    /// Merge fragments in order, most basic first.
    pub fn merge<'a, I>(fragments: I, cls: &ModelDeclaration) -> ModelResult<Self>
    where
        I: IntoIterator<Item = &'a ConfigFragment<T>>,
        T: 'a,
    {
        let mut merged = Self::default();
        for fragment in fragments {
            let fragment = fragment.resolve(cls);
            if fragment.is_empty() {
                continue;
            }
            let (positional, options) = fragment.classify()?;
            for item in positional {
                if !merged.positional.contains(&item) {
                    merged.positional.push(item);
                }
            }
            merged.options.extend(options);
        }
        Ok(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.options.is_empty()
    }

    pub fn option(&self, key: &str) -> Option<&JsonValue> {
        self.options.get(key)
    }

    /// Positional items with the keyword map appended as the final element.
    pub fn into_call_args(self) -> Vec<FragmentEntry<T>> {
        let mut args: Vec<FragmentEntry<T>> = self.positional.into_iter().map(FragmentEntry::Arg).collect();
        args.push(FragmentEntry::Options(self.options));
        args
    }
}

/// Merge the global fragments of every class in `mro` (most derived first, as
/// linearized) followed by the local fragment of the class itself.
pub fn merge_declarative_args<T, G, L>(
    mro: &[Arc<ModelDeclaration>],
    cls: &ModelDeclaration,
    global: G,
    local: L,
) -> ModelResult<MergedArgs<T>>
where
    T: Clone + PartialEq,
    G: Fn(&ModelDeclaration) -> Option<&ConfigFragment<T>>,
    L: Fn(&ModelDeclaration) -> Option<&ConfigFragment<T>>,
{
    let fragments = mro
        .iter()
        .rev()
        .filter_map(|decl| global(decl.as_ref()))
        .chain(local(cls));
    MergedArgs::merge(fragments, cls)
}
