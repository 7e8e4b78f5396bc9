mod common;

use std::sync::Arc;

use elif_declarative::schema::EnumColumnType;
use elif_declarative::{Column, DatabaseValue, Manager, ManagerConfig, Mapper, ModelBuilder, Registry};
use serde_json::json;

use common::init_tracing;

const NULLABLE: [&str; 11] = [
    "small", "big", "ratio", "flag", "label", "body", "payload", "blob", "stamp", "token", "mood",
];

async fn samples() -> (Manager, Arc<Mapper>) {
    init_tracing();
    let registry = Registry::new();
    let sample = ModelBuilder::model("Sample")
        .column(Column::integer("id").primary_key())
        .column(Column::integer("small"))
        .column(Column::big_integer("big"))
        .column(Column::float("ratio"))
        .column(Column::boolean("flag"))
        .column(Column::string("label"))
        .column(Column::text("body"))
        .column(Column::json("payload"))
        .column(Column::binary("blob"))
        .column(Column::datetime("stamp"))
        .column(Column::uuid("token"))
        .column(Column::enumeration("mood", EnumColumnType::new("Mood", ["h", "s"])))
        .register(&registry)
        .unwrap();

    let mut db = Manager::new(Some(registry), ManagerConfig::default()).unwrap();
    db.create_all().await.unwrap();
    (db, sample)
}

#[tokio::test]
async fn test_boolean_column_round_trip() {
    let (mut db, sample) = samples().await;
    let saved = db
        .add_commit(vec![
            sample.from_json(&json!({"flag": true})).unwrap(),
            sample.from_json(&json!({"flag": false})).unwrap(),
        ])
        .await
        .unwrap();
    assert_eq!(saved[0].value("flag"), DatabaseValue::Bool(true));
    assert_eq!(saved[1].value("flag"), DatabaseValue::Bool(false));

    let on = sample
        .query()
        .filter(sample.col("flag").eq(true))
        .all(&mut db)
        .await
        .unwrap();
    assert_eq!(on.len(), 1);
    assert_eq!(on[0].value("flag"), DatabaseValue::Bool(true));
    assert_eq!(on[0].value("id"), saved[0].value("id"));
}

#[tokio::test]
async fn test_unset_columns_read_back_as_null() {
    let (mut db, sample) = samples().await;
    let saved = db.add_commit(sample.from_json(&json!({})).unwrap()).await.unwrap();
    for name in NULLABLE {
        assert_eq!(saved[0].value(name), DatabaseValue::Null, "column {}", name);
    }

    let loaded = sample.query().one(&mut db).await.unwrap();
    for name in NULLABLE {
        assert_eq!(loaded.value(name), DatabaseValue::Null, "column {}", name);
    }
    assert_eq!(loaded.to_dict()["label"], json!(null));
}

#[tokio::test]
async fn test_null_written_outside_the_session_decodes() {
    let (mut db, sample) = samples().await;
    db.execute("INSERT INTO \"sample\" (\"id\") VALUES (9)", &[], None)
        .await
        .unwrap();

    let rows = sample
        .query()
        .filter(sample.col("id").eq(9))
        .all(&mut db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    for name in NULLABLE {
        assert_eq!(rows[0].value(name), DatabaseValue::Null, "column {}", name);
    }

    let raw = db
        .fetch_all("SELECT \"label\", \"flag\", \"blob\" FROM \"sample\"", &[], None)
        .await
        .unwrap();
    assert_eq!(raw[0]["label"], json!(null));
    assert_eq!(raw[0]["flag"], json!(null));
    assert_eq!(raw[0]["blob"], json!(null));
}

#[tokio::test]
async fn test_values_of_every_type_round_trip() {
    let (mut db, sample) = samples().await;
    let input = json!({
        "small": 7,
        "big": 9_000_000_000_i64,
        "ratio": 1.5,
        "flag": true,
        "label": "hello",
        "body": "long text",
        "payload": {"tags": ["a", "b"]},
        "blob": [1, 2, 3],
        "stamp": "2024-01-02T03:04:05+00:00",
        "token": "6f1c2a7e-3b4d-4c5e-8f9a-0b1c2d3e4f5a",
        "mood": "h",
    });
    db.add_commit(sample.from_json(&input).unwrap()).await.unwrap();

    let loaded = sample.query().one(&mut db).await.unwrap();
    let dict = loaded.to_dict();
    for (name, value) in input.as_object().unwrap() {
        assert_eq!(&dict[name], value, "column {}", name);
    }
}
