mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use elif_declarative::events::listener;
use elif_declarative::{DatabaseValue, EventKind, ListenOptions, ModelError};
use serde_json::json;

use common::{fixture, seeded};

#[tokio::test]
async fn test_add_commit_cascades_children() {
    let mut fx = seeded().await;

    assert_eq!(fx.foo.query().count(&mut fx.db).await.unwrap(), 3);
    assert_eq!(fx.bar.query().count(&mut fx.db).await.unwrap(), 6);
    assert_eq!(fx.baz.query().count(&mut fx.db).await.unwrap(), 6);

    let orphans = fx
        .bar
        .query()
        .filter(fx.bar.col("foo_id").is_null())
        .count(&mut fx.db)
        .await
        .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn test_commit_returns_saved_records_with_keys_and_defaults() {
    let mut fx = fixture().await;
    let foo = fx.foo.from_json(&json!({"string": "a"})).unwrap();

    let saved = fx.db.add_commit(foo).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].is_persistent());
    assert!(saved[0].value("_id").as_i64().is_some());
    assert_eq!(saved[0].value("boolean"), DatabaseValue::Bool(true));
    assert!(!saved[0].is_modified());
}

#[tokio::test]
async fn test_belongs_to_parent_is_saved_first() {
    let mut fx = fixture().await;
    let parent = fx.foo.from_json(&json!({"string": "parent"})).unwrap();
    let mut bar = fx.bar.from_json(&json!({"string": "child"})).unwrap();
    bar.set_related("foo", Some(parent)).unwrap();

    let saved = fx.db.add_commit(bar).await.unwrap();
    let bar = &saved[0];
    let foo = bar.related_one("foo").unwrap();
    assert!(foo.is_persistent());
    assert_eq!(bar.value("foo_id"), foo.value("_id"));
}

#[tokio::test]
async fn test_flush_record_updates_modified_columns() {
    let mut fx = fixture().await;
    let mut foo = fx.foo.from_json(&json!({"string": "a", "number": 1})).unwrap();
    foo.flush(&mut fx.db).await.unwrap();
    let id = foo.value("_id");

    foo.set("number", 5).unwrap();
    foo.flush(&mut fx.db).await.unwrap();
    assert!(!foo.is_modified());

    let reloaded = fx.foo.get(&mut fx.db, id).await.unwrap().unwrap();
    assert_eq!(reloaded.value("number"), DatabaseValue::Int64(5));
    assert_eq!(reloaded.value("string"), DatabaseValue::from("a"));
}

#[tokio::test]
async fn test_delete_commit_removes_rows() {
    let mut fx = seeded().await;
    let bazs = fx.baz.query().all(&mut fx.db).await.unwrap();
    fx.db.delete_commit(bazs).await.unwrap();
    assert!(!fx.baz.query().exists(&mut fx.db).await.unwrap());

    let transient = fx.foo.new_record();
    let err = fx.db.delete_commit(transient).await.unwrap_err();
    assert!(matches!(err, ModelError::Validation(_)));
}

#[tokio::test]
async fn test_record_delete_helper_chains() {
    let mut fx = seeded().await;
    let first = fx.baz.query().first(&mut fx.db).await.unwrap().unwrap();
    first.delete(&mut fx.db).commit().await.unwrap();
    assert_eq!(fx.baz.query().count(&mut fx.db).await.unwrap(), 5);
}

#[tokio::test]
async fn test_rollback_discards_uncommitted_work() {
    let mut fx = fixture().await;
    fx.db.add(fx.foo.from_json(&json!({"string": "a"})).unwrap());
    fx.db.flush().await.unwrap();
    fx.db.rollback().await.unwrap();

    assert_eq!(fx.foo.query().count(&mut fx.db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_autoflush_before_query() {
    let mut fx = fixture().await;
    fx.db.add(fx.foo.from_json(&json!({"string": "a"})).unwrap());
    assert_eq!(fx.foo.query().count(&mut fx.db).await.unwrap(), 1);
    assert!(fx.db.pending().is_empty());

    fx.db.set_autoflush(false);
    fx.db.add(fx.foo.from_json(&json!({"string": "b"})).unwrap());
    assert_eq!(fx.foo.query().count(&mut fx.db).await.unwrap(), 1);
    assert_eq!(fx.db.pending().len(), 1);
}

#[tokio::test]
async fn test_refresh_and_expire() {
    let mut fx = seeded().await;
    let mut foo = fx
        .foo
        .query()
        .filter(fx.foo.col("string").eq("foo0"))
        .one(&mut fx.db)
        .await
        .unwrap();

    fx.db
        .execute("UPDATE \"foo\" SET \"number\" = 42", &[], None)
        .await
        .unwrap();
    assert_eq!(foo.value("number"), DatabaseValue::Int64(0));

    foo.refresh(&mut fx.db).await.unwrap();
    assert_eq!(foo.value("number"), DatabaseValue::Int64(42));

    foo.expire(&mut fx.db).unwrap();
    assert!(!foo.is_loaded("number"));
    assert!(foo.is_loaded("_id"));
}

#[tokio::test]
async fn test_load_relationship_on_demand() {
    let mut fx = seeded().await;
    let mut foo = fx
        .foo
        .query()
        .filter(fx.foo.col("string").eq("foo2"))
        .one(&mut fx.db)
        .await
        .unwrap();
    assert!(foo.related("bars").is_none());

    fx.db.load_relationship(&mut foo, "bars").await.unwrap();
    assert_eq!(foo.related_many("bars").len(), 3);

    let err = fx.db.load_relationship(&mut foo, "nope").await.unwrap_err();
    assert!(matches!(err, ModelError::UnknownAttribute { .. }));
}

#[tokio::test]
async fn test_lifecycle_events_fire_in_order() {
    let mut fx = fixture().await;
    let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for kind in [
        EventKind::BeforeInsert,
        EventKind::AfterInsert,
        EventKind::BeforeUpdate,
        EventKind::AfterUpdate,
        EventKind::BeforeDelete,
        EventKind::AfterDelete,
    ] {
        let calls = Arc::clone(&calls);
        fx.foo
            .listen(
                kind,
                None,
                listener(move |ctx| {
                    calls.lock().push(ctx.kind);
                    Ok(())
                }),
                ListenOptions::default(),
            )
            .unwrap();
    }

    let mut foo = fx.foo.from_json(&json!({"string": "a"})).unwrap();
    foo.flush(&mut fx.db).await.unwrap();
    foo.set("string", "b").unwrap();
    foo.flush(&mut fx.db).await.unwrap();
    fx.db.delete_commit(foo).await.unwrap();

    assert_eq!(
        *calls.lock(),
        vec![
            EventKind::BeforeInsert,
            EventKind::AfterInsert,
            EventKind::BeforeUpdate,
            EventKind::AfterUpdate,
            EventKind::BeforeDelete,
            EventKind::AfterDelete,
        ]
    );
}

#[tokio::test]
async fn test_before_insert_listener_can_fill_columns() {
    let mut fx = fixture().await;
    fx.foo
        .listen(
            EventKind::BeforeInsert,
            None,
            listener(|ctx| {
                if ctx.target.value("number").is_null() {
                    ctx.target.set("number", 7)?;
                }
                Ok(())
            }),
            ListenOptions::default(),
        )
        .unwrap();

    let saved = fx
        .db
        .add_commit(fx.foo.from_json(&json!({"string": "a"})).unwrap())
        .await
        .unwrap();
    assert_eq!(saved[0].value("number"), DatabaseValue::Int64(7));
}

#[tokio::test]
async fn test_failing_listener_aborts_flush_and_keeps_pending() {
    let mut fx = fixture().await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    fx.foo
        .listen(
            EventKind::BeforeInsert,
            None,
            listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(elif_declarative::EventError::validation("rejected"))
            }),
            ListenOptions::default(),
        )
        .unwrap();

    fx.db.add(fx.foo.from_json(&json!({"string": "a"})).unwrap());
    let err = fx.db.flush().await.unwrap_err();
    assert!(matches!(err, ModelError::Validation(_)));
    assert_eq!(fx.db.pending().len(), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_flush_is_rolled_back_before_retry() {
    let mut fx = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    fx.foo
        .listen(
            EventKind::AfterInsert,
            None,
            listener(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(elif_declarative::EventError::observer("first insert fails"));
                }
                Ok(())
            }),
            ListenOptions::default(),
        )
        .unwrap();

    let foo = fx.foo.from_json(&json!({"string": "once", "number": 5})).unwrap();
    assert!(fx.db.add_commit(foo).await.is_err());
    assert_eq!(fx.db.pending().len(), 1);
    assert!(!fx.db.pending()[0].is_persistent());
    assert!(!fx.db.in_transaction(None));

    let saved = fx.db.commit().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let rows = fx
        .db
        .fetch_all("SELECT \"_id\", \"number\" FROM \"foo\"", &[], None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["number"], json!(5));
}

#[tokio::test]
async fn test_models_route_to_their_bind() {
    let mut fx = fixture().await;
    let qux = fx.qux.from_json(&json!({"string": "q"})).unwrap();
    fx.db.add_commit(qux).await.unwrap();

    assert_eq!(fx.qux.query().count(&mut fx.db).await.unwrap(), 1);
    assert!(fx.db.in_transaction(Some("qux")));

    let rows = fx
        .db
        .fetch_all("SELECT \"string\" FROM \"qux\"", &[], Some("qux"))
        .await
        .unwrap();
    assert_eq!(rows[0]["string"], json!("q"));

    // The default bind never saw the qux table
    let err = fx
        .db
        .fetch_all("SELECT * FROM \"qux\"", &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Database(_)));
}

#[tokio::test]
async fn test_independent_session_over_bind_engine() {
    let mut fx = fixture().await;
    let mut session = fx.db.init_session();
    let qux = fx.qux.from_json(&json!({"string": "q"})).unwrap();

    session.add_commit(qux).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(fx.qux.query().count(&mut fx.db).await.unwrap(), 1);
}

