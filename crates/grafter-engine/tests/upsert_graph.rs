//! End-to-end upserts against the in-memory store.

use grafter_core::{JoinTable, RecordType, Relation, RelationExpression, Schema};
use grafter_engine::{ErrorKind, GraphOptions, OptionFlag, UpsertError, UpsertGraph, UpsertStats};
use grafter_storage::{InMemoryStore, OpKind};
use serde_json::{json, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn schema() -> Schema {
    Schema::new()
        .with_type(
            RecordType::new("Person", "persons")
                .with_relation(Relation::to_one("parent", "Person", &["parentId"], &["id"]))
                .with_relation(Relation::to_many("children", "Person", &["id"], &["parentId"]))
                .with_relation(Relation::to_many("pets", "Animal", &["id"], &["ownerId"]))
                .with_relation(Relation::many_to_many(
                    "movies",
                    "Movie",
                    &["id"],
                    &["id"],
                    JoinTable {
                        table: "persons_movies".into(),
                        owner_columns: vec!["personId".into()],
                        related_columns: vec!["movieId".into()],
                        extra: vec!["role".into()],
                    },
                ))
                .with_validator(|record, _| match record.get("name") {
                    Some(Value::String(name)) if name.is_empty() => {
                        Err("name must not be empty".to_string())
                    }
                    _ => Ok(()),
                }),
        )
        .with_type(RecordType::new("Animal", "animals"))
        .with_type(RecordType::new("Movie", "movies"))
}

async fn upsert(
    store: &InMemoryStore,
    input: Value,
    options: GraphOptions,
) -> Result<(Value, UpsertStats), UpsertError> {
    init_tracing();
    let schema = schema();
    UpsertGraph::new(store, &schema, "Person")
        .options(options)
        .run_with_stats(input)
        .await
}

async fn writes(store: &InMemoryStore) -> usize {
    store.count(OpKind::Insert).await
        + store.count(OpKind::Update).await
        + store.count(OpKind::Delete).await
}

fn column(rows: &[serde_json::Map<String, Value>], id: i64, name: &str) -> Value {
    rows.iter()
        .find(|r| r.get("id") == Some(&json!(id)))
        .and_then(|r| r.get(name).cloned())
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn inserts_a_new_tree() {
    let store = InMemoryStore::new();
    let (result, stats) = upsert(
        &store,
        json!({"name": "A", "children": [{"name": "B"}]}),
        GraphOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(stats.inserted, 2);
    assert_eq!(store.count(OpKind::Insert).await, 2);
    assert_eq!(store.count(OpKind::Update).await, 0);
    assert_eq!(result["children"][0]["parentId"], result["id"]);
    assert_eq!(store.rows("persons").await.len(), 2);
}

#[tokio::test]
async fn a_second_identical_upsert_writes_nothing() {
    let store = InMemoryStore::new();
    let (first, _) = upsert(
        &store,
        json!({"name": "A", "children": [{"name": "B"}], "pets": [{"name": "dog"}]}),
        GraphOptions::default(),
    )
    .await
    .unwrap();
    store.clear_ops().await;

    let (_, stats) = upsert(&store, first, GraphOptions::default()).await.unwrap();
    assert_eq!(stats, UpsertStats::default());
    assert_eq!(writes(&store).await, 0);
}

#[tokio::test]
async fn dependencies_are_inserted_first() {
    let store = InMemoryStore::new();
    let (result, stats) = upsert(
        &store,
        json!({"name": "A", "parent": {"name": "P"}, "children": [{"name": "C"}]}),
        GraphOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(stats.inserted, 3);
    assert_eq!(store.count(OpKind::Insert).await, 3);
    assert_eq!(result["parent"]["id"], json!(1));
    assert_eq!(result["parentId"], json!(1));
    assert_eq!(result["id"], json!(2));
    assert_eq!(result["children"][0]["parentId"], json!(2));
}

#[tokio::test]
async fn unknown_child_id_fails_before_any_write() {
    let store = InMemoryStore::new();
    store.seed("persons", [json!({"id": 5, "name": "A"})]).await;

    let err = upsert(
        &store,
        json!({"id": 5, "name": "A", "children": [{"id": 9}]}),
        GraphOptions::default(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    match err {
        UpsertError::NotFound { data_path, message } => {
            assert_eq!(data_path, "children[0]");
            assert!(message.contains("is not a child of model (id=5)"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(writes(&store).await, 0);
}

#[tokio::test]
async fn db_ref_relates_a_to_one_row() {
    let store = InMemoryStore::new();
    store
        .seed(
            "persons",
            [json!({"id": 1, "name": "A", "parentId": null}), json!({"id": 42, "name": "P"})],
        )
        .await;

    let (result, stats) = upsert(
        &store,
        json!({"id": 1, "parent": {"#dbRef": 42}}),
        GraphOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.related, 1);
    assert_eq!(store.count(OpKind::Insert).await, 0);
    assert_eq!(store.count(OpKind::Update).await, 1);
    assert_eq!(column(&store.rows("persons").await, 1, "parentId"), json!(42));
    assert_eq!(result["parent"], json!({"id": 42}));
}

#[tokio::test]
async fn missing_siblings_are_deleted_and_changes_patched() {
    let store = InMemoryStore::new();
    store
        .seed(
            "persons",
            [
                json!({"id": 1, "name": "A"}),
                json!({"id": 2, "name": "B", "parentId": 1}),
                json!({"id": 3, "name": "C", "parentId": 1}),
            ],
        )
        .await;

    let (result, stats) = upsert(
        &store,
        json!({"id": 1, "children": [{"id": 2, "name": "B2"}, {"name": "D"}]}),
        GraphOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(
        stats,
        UpsertStats {
            inserted: 1,
            patched: 1,
            deleted: 1,
            unrelated: 0,
            related: 0,
        }
    );
    let rows = store.rows("persons").await;
    let ids: Vec<Value> = rows.iter().filter_map(|r| r.get("id").cloned()).collect();
    // deletes run before inserts, so the new row reuses the freed id
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(column(&rows, 2, "name"), json!("B2"));
    assert_eq!(column(&rows, 3, "name"), json!("D"));
    assert_eq!(column(&rows, 3, "parentId"), json!(1));
    assert_eq!(result["children"][1]["id"], json!(3));
}

#[tokio::test]
async fn unrelate_clears_the_foreign_key() {
    let store = InMemoryStore::new();
    store
        .seed(
            "persons",
            [
                json!({"id": 1}),
                json!({"id": 2, "parentId": 1}),
                json!({"id": 3, "parentId": 1}),
            ],
        )
        .await;
    let options = GraphOptions {
        unrelate: true.into(),
        ..GraphOptions::default()
    };

    let (_, stats) = upsert(&store, json!({"id": 1, "children": [{"id": 2}]}), options)
        .await
        .unwrap();

    assert_eq!(stats.unrelated, 1);
    assert_eq!(stats.deleted, 0);
    let rows = store.rows("persons").await;
    assert_eq!(rows.len(), 3);
    assert_eq!(column(&rows, 3, "parentId"), Value::Null);
    assert_eq!(column(&rows, 2, "parentId"), json!(1));
}

#[tokio::test]
async fn many_to_many_writes_join_rows_with_extras() {
    let store = InMemoryStore::new();
    store.seed("persons", [json!({"id": 1})]).await;
    store.seed("movies", [json!({"id": 10, "title": "Old"})]).await;
    let options = GraphOptions {
        relate: OptionFlag::paths(["movies"]),
        ..GraphOptions::default()
    };

    let (_, stats) = upsert(
        &store,
        json!({"id": 1, "movies": [{"id": 10, "role": "cameo"}, {"title": "New", "role": "lead"}]}),
        options,
    )
    .await
    .unwrap();

    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.related, 1);
    let movies = store.rows("movies").await;
    assert_eq!(movies.len(), 2);
    assert!(movies.iter().all(|m| m.get("role").is_none()));
    let joins = store.rows("persons_movies").await;
    assert_eq!(
        joins.into_iter().map(Value::Object).collect::<Vec<_>>(),
        vec![
            json!({"personId": 1, "movieId": 10, "role": "cameo"}),
            json!({"personId": 1, "movieId": 11, "role": "lead"}),
        ]
    );

    store.clear_ops().await;
    let (_, stats) = upsert(
        &store,
        json!({"id": 1, "movies": [{"id": 10, "role": "star"}, {"id": 11, "role": "lead"}]}),
        GraphOptions::default(),
    )
    .await
    .unwrap();

    // extras live on the join row, so the movie itself is not patched
    assert_eq!(stats.patched, 0);
    assert_eq!(store.count(OpKind::Update).await, 1);
    let joins = store.rows("persons_movies").await;
    assert_eq!(joins[0].get("role"), Some(&json!("star")));
    assert_eq!(joins[1].get("role"), Some(&json!("lead")));
}

#[tokio::test]
async fn references_resolve_to_inserted_rows() {
    let store = InMemoryStore::new();
    let input = json!([
        {"#id": "jenny", "name": "Jenny"},
        {"name": "Sister of #ref{jenny.name}", "parent": {"#ref": "jenny", "name": "Someone"}}
    ]);

    let err = upsert(&store, input.clone(), GraphOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let options = GraphOptions {
        allow_refs: true,
        ..GraphOptions::default()
    };
    let (result, stats) = upsert(&store, input, options).await.unwrap();

    assert_eq!(stats.inserted, 2);
    assert_eq!(store.count(OpKind::Update).await, 0);
    assert_eq!(result[1]["name"], json!("Sister of Jenny"));
    assert_eq!(result[1]["parentId"], result[0]["id"]);
    assert!(result[1]["parent"].get("#ref").is_none());

    // the reference takes every property of its target, its own included
    let own = |value: &Value| -> Vec<(String, Value)> {
        value
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(key, _)| !key.starts_with('#'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    };
    assert_eq!(own(&result[1]["parent"]), own(&result[0]));
    assert_eq!(result[1]["parent"]["name"], json!("Jenny"));
}

#[tokio::test]
async fn references_into_related_subtrees_fail_before_writing() {
    let store = InMemoryStore::new();
    store
        .seed("persons", [json!({"id": 1, "name": "A"}), json!({"id": 7, "name": "X"})])
        .await;
    let options = GraphOptions {
        relate: OptionFlag::paths(["children"]),
        allow_refs: true,
        ..GraphOptions::default()
    };

    let err = upsert(
        &store,
        json!({
            "id": 1,
            "children": [{"id": 7, "children": [{"#id": "g", "name": "G"}]}],
            "pets": [{"name": "pet of #ref{g.name}"}]
        }),
        options,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(writes(&store).await, 0);
    assert!(store.rows("animals").await.is_empty());
}

#[tokio::test]
async fn reference_cycles_are_rejected() {
    let store = InMemoryStore::new();
    let options = GraphOptions {
        allow_refs: true,
        ..GraphOptions::default()
    };
    let err = upsert(
        &store,
        json!({"#id": "a", "name": "A", "parent": {"name": "P", "parent": {"#ref": "a"}}}),
        options,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, UpsertError::CyclicGraph { .. }));
    assert_eq!(writes(&store).await, 0);
}

#[tokio::test]
async fn related_nodes_carry_their_nested_data() {
    let store = InMemoryStore::new();
    store
        .seed("persons", [json!({"id": 1, "name": "A"}), json!({"id": 7, "name": "X"})])
        .await;
    let options = GraphOptions {
        relate: OptionFlag::paths(["children"]),
        ..GraphOptions::default()
    };

    let (result, _) = upsert(
        &store,
        json!({"id": 1, "children": [{"id": 7, "children": [{"name": "Grandchild"}]}]}),
        options,
    )
    .await
    .unwrap();

    let rows = store.rows("persons").await;
    assert_eq!(column(&rows, 7, "parentId"), json!(1));
    assert_eq!(column(&rows, 8, "name"), json!("Grandchild"));
    assert_eq!(column(&rows, 8, "parentId"), json!(7));
    assert_eq!(result["children"][0]["children"][0]["id"], json!(8));
}

#[tokio::test]
async fn insert_only_skips_the_fetch() {
    let store = InMemoryStore::new();
    let (result, stats) = upsert(
        &store,
        json!({"id": 5, "name": "A", "children": [{"name": "B"}]}),
        GraphOptions::insert_only(),
    )
    .await
    .unwrap();

    assert_eq!(stats.inserted, 2);
    assert_eq!(store.count(OpKind::Select).await, 0);
    assert_eq!(result["id"], json!(5));
    assert_eq!(result["children"][0]["parentId"], json!(5));
}

#[tokio::test]
async fn insert_only_cannot_relate_to_many() {
    let store = InMemoryStore::new();
    store.seed("animals", [json!({"id": 3})]).await;
    let err = upsert(
        &store,
        json!({"name": "A", "pets": [{"#dbRef": 3}]}),
        GraphOptions::insert_only(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, UpsertError::UnsupportedOperation { .. }));
    assert_eq!(writes(&store).await, 0);
}

#[tokio::test]
async fn unallowed_relations_are_rejected() {
    init_tracing();
    let store = InMemoryStore::new();
    let schema = schema();
    let err = UpsertGraph::new(&store, &schema, "Person")
        .allow_graph(RelationExpression::parse("children").unwrap())
        .run(json!({"name": "A", "pets": [{"name": "dog"}]}))
        .await
        .unwrap_err();

    assert!(matches!(err, UpsertError::UnallowedRelation { .. }));
    assert!(store.ops().await.is_empty());
}

#[tokio::test]
async fn validator_rejections_abort_the_call() {
    let store = InMemoryStore::new();
    let err = upsert(&store, json!({"name": ""}), GraphOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(store.rows("persons").await.is_empty());
}

#[tokio::test]
async fn unknown_option_paths_are_rejected() {
    let store = InMemoryStore::new();
    let options = GraphOptions {
        relate: OptionFlag::paths(["children.toys"]),
        ..GraphOptions::default()
    };
    let err = upsert(&store, json!({"name": "A"}), options).await.unwrap_err();
    assert!(matches!(err, UpsertError::InvalidOptions { .. }));
}
