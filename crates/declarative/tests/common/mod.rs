#![allow(dead_code)]

use std::sync::Arc;

use elif_declarative::search::{self, SearchConfig};
use elif_declarative::{
    Column, Manager, ManagerConfig, Mapper, ModelBuilder, Record, Registry, Relationship,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Route statement logging to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Fixture {
    pub db: Manager,
    pub foo: Arc<Mapper>,
    pub bar: Arc<Mapper>,
    pub baz: Arc<Mapper>,
    pub qux: Arc<Mapper>,
}

pub fn registry() -> (Registry, Arc<Mapper>, Arc<Mapper>, Arc<Mapper>, Arc<Mapper>) {
    let registry = Registry::new();

    let foo = ModelBuilder::model("Foo")
        .column(Column::integer("_id").primary_key())
        .column(Column::string("string"))
        .column(Column::integer("number"))
        .column(Column::boolean("boolean").default_value(true))
        .relationship(Relationship::has_many("bars", "Bar"))
        .advanced_search(
            SearchConfig::new()
                .filter("foo_string", search::eq("string"))
                .filter("foo_number", search::ge("number")),
        )
        .simple_search(SearchConfig::new().filter("foo_string", search::contains("string")))
        .register(&registry)
        .unwrap();

    let bar = ModelBuilder::model("Bar")
        .column(Column::integer("_id").primary_key())
        .column(Column::string("string"))
        .column(Column::integer("number"))
        .column(Column::integer("foo_id").foreign_key("foo._id"))
        .relationship(Relationship::belongs_to("foo", "Foo"))
        .relationship(Relationship::has_many("bazs", "Baz"))
        .advanced_search(SearchConfig::new().filter("bar_string", search::eq("string")))
        .simple_search(SearchConfig::new().filter("bar_string", search::contains("string")))
        .register(&registry)
        .unwrap();

    let baz = ModelBuilder::model("Baz")
        .column(Column::integer("_id").primary_key())
        .column(Column::string("string"))
        .column(Column::integer("number"))
        .column(Column::integer("bar_id").foreign_key("bar._id"))
        .relationship(Relationship::belongs_to("bar", "Bar"))
        .register(&registry)
        .unwrap();

    let qux = ModelBuilder::model("Qux")
        .bind_key("qux")
        .column(Column::integer("_id").primary_key())
        .column(Column::string("string"))
        .register(&registry)
        .unwrap();

    (registry, foo, bar, baz, qux)
}

pub async fn fixture() -> Fixture {
    init_tracing();
    let (registry, foo, bar, baz, qux) = registry();
    let config = ManagerConfig::default().bind("qux", "sqlite::memory:");
    let mut db = Manager::new(Some(registry), config).unwrap();
    db.create_all().await.unwrap();
    Fixture { db, foo, bar, baz, qux }
}

/// Three foos, each with `index + 1` bars holding one baz apiece.
pub fn foo_graph(fixture: &Fixture) -> Vec<Record> {
    (0..3)
        .map(|i| {
            let mut foo = fixture
                .foo
                .from_json(&json!({"string": format!("foo{}", i), "number": i}))
                .unwrap();
            for j in 0..=i {
                let mut bar = fixture
                    .bar
                    .from_json(&json!({"string": format!("bar{}{}", i, j), "number": j}))
                    .unwrap();
                let baz = fixture
                    .baz
                    .from_json(&json!({"string": format!("baz{}{}", i, j)}))
                    .unwrap();
                bar.append("bazs", baz).unwrap();
                foo.append("bars", bar).unwrap();
            }
            foo
        })
        .collect()
}

pub async fn seeded() -> Fixture {
    let mut fixture = fixture().await;
    let graph = foo_graph(&fixture);
    fixture.db.add_commit(graph).await.unwrap();
    fixture
}
