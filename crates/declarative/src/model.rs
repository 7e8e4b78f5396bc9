//! Typed bridge between serde structs and mapped records.
//!
//! A type implementing [`Model`] names the mapped model it mirrors and moves
//! between itself and a [`Record`] through JSON:
//!
//! ```ignore
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Foo {
//!     #[serde(rename = "_id")]
//!     id: Option<i64>,
//!     string: String,
//! }
//!
//! impl Model for Foo {
//!     const MODEL_NAME: &'static str = "Foo";
//! }
//!
//! let foos: Vec<Foo> = Foo::query(&registry)?.all_as(&mut session).await?;
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::ModelResult;
use crate::mapper::Mapper;
use crate::query::Query;
use crate::record::Record;
use crate::registry::Registry;

/// A serde type backed by a mapped model.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    /// Name the model was registered under
    const MODEL_NAME: &'static str;

    fn mapper(registry: &Registry) -> ModelResult<Arc<Mapper>> {
        registry.mapper(Self::MODEL_NAME)
    }

    fn query(registry: &Registry) -> ModelResult<Query> {
        Ok(Self::mapper(registry)?.query())
    }

    /// Deserialize from the record's loaded attributes.
    fn from_record(record: &Record) -> ModelResult<Self> {
        Ok(serde_json::from_value(JsonValue::Object(record.to_dict()))?)
    }

    /// A transient record holding this value's attributes. Null fields are
    /// left unset so database defaults apply.
    fn to_record(&self, registry: &Registry) -> ModelResult<Record> {
        let mapper = Self::mapper(registry)?;
        let mut data = serde_json::to_value(self)?;
        if let JsonValue::Object(map) = &mut data {
            map.retain(|_, value| !value.is_null());
        }
        mapper.from_json(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::ModelBuilder;
    use crate::schema::Column;
    use crate::value::DatabaseValue;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Foo {
        #[serde(rename = "_id")]
        id: Option<i64>,
        string: String,
        #[serde(default)]
        number: Option<i64>,
    }

    impl Model for Foo {
        const MODEL_NAME: &'static str = "Foo";
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .column(Column::string("string"))
            .column(Column::integer("number"))
            .register(&registry)
            .unwrap();
        registry
    }

    #[test]
    fn test_to_record_skips_nulls() {
        let registry = registry();
        let foo = Foo {
            id: None,
            string: "a".to_string(),
            number: Some(2),
        };
        let record = foo.to_record(&registry).unwrap();
        assert_eq!(record.model_name(), "Foo");
        assert!(record.get("_id").is_none());
        assert_eq!(record.value("string"), DatabaseValue::from("a"));
        assert_eq!(record.value("number"), DatabaseValue::Int64(2));
    }

    #[test]
    fn test_from_record_round_trips_loaded_values() {
        let registry = registry();
        let mapper = Foo::mapper(&registry).unwrap();
        let mut record = mapper.new_record();
        record.set("_id", 7).unwrap();
        record.set("string", "b").unwrap();

        let foo = Foo::from_record(&record).unwrap();
        assert_eq!(
            foo,
            Foo {
                id: Some(7),
                string: "b".to_string(),
                number: None,
            }
        );
    }

    #[test]
    fn test_unknown_model_name() {
        let registry = Registry::new();
        assert!(Foo::query(&registry).is_err());
    }
}
