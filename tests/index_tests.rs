/// Index tests
///
/// Map and reduce indexes kept in step with document writes.
/// Run with: cargo test --test index_tests
mod common;

use common::{DayCount, Post, PostTag, blog_store, post, raw_rows};
use memodocs::{CompareOp, DbError, InMemoryDB, MapIndex, ReduceIndex, Store, StoreConfig};

async fn day_count(store: &Store, index: &str, day: &str) -> Option<i64> {
    let mut session = store.create_session();
    session
        .query_index::<DayCount>(index)
        .filter("day", CompareOp::Eq, day)
        .first()
        .await
        .unwrap()
        .map(|entry| entry.count)
}

#[tokio::test]
async fn test_counting_index_lifecycle() {
    let db = InMemoryDB::new();
    let store = blog_store(&db).await;

    let mut session = store.create_session();
    let posts: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|title| session.save(post("20210101", title, &[])).unwrap())
        .collect();
    session.save_changes().await.unwrap();
    assert_eq!(day_count(&store, "PostsByDay", "20210101").await, Some(3));

    session.delete(&posts[0]).unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(day_count(&store, "PostsByDay", "20210101").await, Some(2));
    assert_eq!(raw_rows(&db, "PostsByDay_Document").await.len(), 2);

    session.delete(&posts[1]).unwrap();
    session.delete(&posts[2]).unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(day_count(&store, "PostsByDay", "20210101").await, None);
    assert!(raw_rows(&db, "PostsByDay").await.is_empty());
    assert!(raw_rows(&db, "PostsByDay_Document").await.is_empty());
}

#[tokio::test]
async fn test_delete_and_create_in_one_flush_updates_the_same_row() {
    let db = InMemoryDB::new();
    let store = blog_store(&db).await;

    let mut session = store.create_session();
    let first = session.save(post("20210101", "first", &[])).unwrap();
    session.save_changes().await.unwrap();

    let before = raw_rows(&db, "PostsByDay").await;
    assert_eq!(before.len(), 1);
    let row_id = before[0][0].as_i64();
    assert_eq!(before[0][2].as_i64(), Some(1));

    session.delete(&first).unwrap();
    let second = session.save(post("20210101", "second", &[])).unwrap();
    session.save_changes().await.unwrap();

    let after = raw_rows(&db, "PostsByDay").await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0][0].as_i64(), row_id);
    assert_eq!(after[0][2].as_i64(), Some(2));
    assert_eq!(after[0][4].as_i64(), Some(1));

    let bridges = raw_rows(&db, "PostsByDay_Document").await;
    assert_eq!(bridges.len(), 1);
    assert_eq!(bridges[0][0].as_i64(), Some(second.id()));
    assert_eq!(bridges[0][1].as_i64(), row_id);
}

#[tokio::test]
async fn test_moving_a_document_between_groups() {
    let db = InMemoryDB::new();
    let store = blog_store(&db).await;

    let mut session = store.create_session();
    let moved = session.save(post("20210101", "moved", &[])).unwrap();
    session.save(post("20210102", "stays", &[])).unwrap();
    session.save_changes().await.unwrap();

    moved.modify(|p| p.day = "20210102".into());
    session.update(&moved).unwrap();
    session.save_changes().await.unwrap();

    assert_eq!(day_count(&store, "PostsByDay", "20210101").await, None);
    assert_eq!(day_count(&store, "PostsByDay", "20210102").await, Some(2));
    assert_eq!(day_count(&store, "DayTotals", "20210101").await, None);
    assert_eq!(day_count(&store, "DayTotals", "20210102").await, Some(2));
}

#[tokio::test]
async fn test_reduce_without_delete_recomputes() {
    let db = InMemoryDB::new();
    let store = blog_store(&db).await;

    let mut session = store.create_session();
    let handles: Vec<_> = (0..4)
        .map(|n| session.save(post("20210105", &format!("p{}", n), &[])).unwrap())
        .collect();
    session.save_changes().await.unwrap();
    assert_eq!(day_count(&store, "DayTotals", "20210105").await, Some(4));

    session.delete(&handles[0]).unwrap();
    session.delete(&handles[3]).unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(day_count(&store, "DayTotals", "20210105").await, Some(2));
    assert_eq!(day_count(&store, "PostsByDay", "20210105").await, Some(2));
}

#[tokio::test]
async fn test_map_index_follows_document() {
    let db = InMemoryDB::new();
    let store = blog_store(&db).await;

    let mut session = store.create_session();
    let handle = session.save(post("20210101", "tagged", &["rust", "db"])).unwrap();
    session.save_changes().await.unwrap();

    let tags = |rows: Vec<memodocs::Row>| {
        let mut tags: Vec<String> = rows
            .iter()
            .map(|row| row[2].as_str().unwrap().to_string())
            .collect();
        tags.sort();
        tags
    };
    assert_eq!(tags(raw_rows(&db, "PostTags").await), vec!["db", "rust"]);

    handle.modify(|p| p.tags = vec!["rust".into(), "async".into()]);
    session.update(&handle).unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(tags(raw_rows(&db, "PostTags").await), vec!["async", "rust"]);

    // Rows carry the owning document id
    for row in raw_rows(&db, "PostTags").await {
        assert_eq!(row[1].as_i64(), Some(handle.id()));
    }

    session.delete(&handle).unwrap();
    session.save_changes().await.unwrap();
    assert!(raw_rows(&db, "PostTags").await.is_empty());
}

#[tokio::test]
async fn test_query_documents_through_indexes() {
    let store = blog_store(&InMemoryDB::new()).await;
    let mut session = store.create_session();
    let rust = session.save(post("20210101", "rust", &["rust", "lang"])).unwrap();
    let db = session.save(post("20210102", "db", &["db"])).unwrap();
    let both = session.save(post("20210102", "both", &["rust", "db"])).unwrap();
    session.save_changes().await.unwrap();

    let mut session = store.create_session();
    let tagged = session
        .query::<Post>()
        .with_index("PostTags")
        .filter("tag", CompareOp::Eq, "rust")
        .order_by("DocumentId")
        .list()
        .await
        .unwrap();
    let ids: Vec<i64> = tagged.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec![rust.id(), both.id()]);

    // A document behind several matching rows is returned once
    let count = session
        .query::<Post>()
        .with_index("PostTags")
        .filter_in("tag", vec!["rust".into(), "db".into()])
        .count()
        .await
        .unwrap();
    assert_eq!(count, 3);

    let on_day = session
        .query::<Post>()
        .with_index("PostsByDay")
        .filter("day", CompareOp::Eq, "20210102")
        .list()
        .await
        .unwrap();
    let ids: Vec<i64> = on_day.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec![db.id(), both.id()]);

    // Results go through the identity map
    let again = session.get::<Post>(both.id()).await.unwrap().unwrap();
    assert!(again.ptr_eq(&on_day[1]));
}

#[tokio::test]
async fn test_query_paging_and_counts() {
    let store = blog_store(&InMemoryDB::new()).await;
    let mut session = store.create_session();
    let ids: Vec<i64> = (0..5)
        .map(|n| session.save(post("20210101", &format!("p{}", n), &[])).unwrap().id())
        .collect();
    session.save_changes().await.unwrap();

    let mut session = store.create_session();
    let page = session
        .query::<Post>()
        .order_by_desc("Id")
        .skip(1)
        .take(2)
        .list()
        .await
        .unwrap();
    let page_ids: Vec<i64> = page.iter().map(|h| h.id()).collect();
    assert_eq!(page_ids, vec![ids[3], ids[2]]);

    let total = session.query::<Post>().skip(1).take(2).count().await.unwrap();
    assert_eq!(total, 5);

    let first = session.query::<Post>().first().await.unwrap().unwrap();
    assert_eq!(first.id(), ids[0]);
    assert_eq!(session.query::<common::Author>().count().await.unwrap(), 0);

    let rows = session
        .query_index::<DayCount>("PostsByDay")
        .count()
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_index_query_errors() {
    let store = blog_store(&InMemoryDB::new()).await;
    let mut session = store.create_session();

    let unknown = session.query_index::<PostTag>("Nope").list().await;
    assert!(matches!(unknown, Err(DbError::UnknownIndex(_))));

    let wrong_type = session
        .query::<common::Author>()
        .with_index("PostTags")
        .list()
        .await;
    assert!(matches!(wrong_type, Err(DbError::InvalidState(_))));
}

#[tokio::test]
async fn test_delete_that_drops_a_populated_row_is_rejected() {
    let db = InMemoryDB::new();
    let store = Store::builder(db.clone())
        .register(
            ReduceIndex::<Post, DayCount>::new("Broken")
                .map(|post: &Post| {
                    vec![DayCount {
                        day: post.day.clone(),
                        count: 1,
                    }]
                })
                .group(|entry: &DayCount| entry.day.clone())
                .reduce(|existing: Option<&DayCount>, entries: &[DayCount]| DayCount {
                    day: entries[0].day.clone(),
                    count: existing.map_or(0, |e| e.count) + entries.len() as i64,
                })
                .delete(|_: &DayCount, _: &[DayCount]| None),
        )
        .build()
        .await
        .unwrap();

    let mut session = store.create_session();
    let first = session.save(post("20210101", "a", &[])).unwrap();
    session.save(post("20210101", "b", &[])).unwrap();
    session.save_changes().await.unwrap();

    session.delete(&first).unwrap();
    let err = session.save_changes().await.unwrap_err();
    assert!(matches!(err, DbError::DefinitionViolation(_)));

    // Nothing was written
    assert_eq!(raw_rows(&db, "Document").await.len(), 2);
    assert_eq!(raw_rows(&db, "Broken_Document").await.len(), 2);
    assert_eq!(session.state(&first), Some(memodocs::EntityState::Removed));
}

#[tokio::test]
async fn test_registration_errors_surface_from_build() {
    let duplicate = Store::in_memory()
        .register(common::tags_index())
        .register(common::tags_index())
        .build()
        .await;
    assert!(matches!(duplicate, Err(DbError::DuplicateIndex(_))));

    let incomplete = Store::in_memory()
        .register(ReduceIndex::<Post, DayCount>::new("Incomplete").map(|_: &Post| Vec::new()))
        .build()
        .await;
    assert!(matches!(incomplete, Err(DbError::InvalidDefinition(_))));

    let bad_name = Store::in_memory()
        .register(common::tags_index())
        .config(StoreConfig::new().table_prefix("bad prefix "))
        .build()
        .await;
    assert!(matches!(bad_name, Err(DbError::InvalidDefinition(_))));
}

#[tokio::test]
async fn test_index_names_cannot_reuse_store_tables() {
    let documents = Store::in_memory()
        .register(MapIndex::<Post, PostTag>::new("Document").map(|_: &Post| Vec::new()))
        .build()
        .await;
    assert!(matches!(documents, Err(DbError::InvalidDefinition(_))));

    // Clashes with the bridge table of the reduce index
    let bridge = Store::in_memory()
        .register(common::posts_by_day())
        .register(MapIndex::<Post, PostTag>::new("PostsByDay_Document").map(|_: &Post| Vec::new()))
        .build()
        .await;
    assert!(matches!(bridge, Err(DbError::InvalidDefinition(_))));

    let case_only = Store::in_memory()
        .register(MapIndex::<Post, PostTag>::new("document").map(|_: &Post| Vec::new()))
        .build()
        .await;
    assert!(matches!(case_only, Err(DbError::InvalidDefinition(_))));

    let db = InMemoryDB::new();
    assert!(
        Store::builder(db.clone())
            .register(common::posts_by_day())
            .register(MapIndex::<Post, PostTag>::new("DocumentTags").map(|_: &Post| Vec::new()))
            .build()
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_table_prefix_applies_to_every_table() {
    let db = InMemoryDB::new();
    let store = common::builder(&db)
        .config(StoreConfig::new().table_prefix("blog_"))
        .build()
        .await
        .unwrap();

    let mut tables = db.table_names().await;
    tables.sort();
    assert_eq!(
        tables,
        vec![
            "blog_DayTotals",
            "blog_DayTotals_Document",
            "blog_Document",
            "blog_PostTags",
            "blog_PostsByDay",
            "blog_PostsByDay_Document",
        ]
    );

    let mut session = store.create_session();
    session.save(post("20210101", "prefixed", &["x"])).unwrap();
    session.save_changes().await.unwrap();
    assert_eq!(raw_rows(&db, "blog_PostTags").await.len(), 1);
}

#[tokio::test]
async fn test_reopening_a_store_continues_ids() {
    let db = InMemoryDB::new();
    let first_id = {
        let store = blog_store(&db).await;
        let mut session = store.create_session();
        let id = session.save(post("20210101", "before", &["a"])).unwrap().id();
        session.save_changes().await.unwrap();
        id
    };

    let store = blog_store(&db).await;
    let mut session = store.create_session();
    let next = session.save(post("20210101", "after", &["a"])).unwrap();
    session.save_changes().await.unwrap();
    assert!(next.id() > first_id);
    assert_eq!(day_count(&store, "PostsByDay", "20210101").await, Some(2));
}

#[tokio::test]
async fn test_schema_script_uses_the_dialect() {
    let store = common::builder(&InMemoryDB::new())
        .dialect(memodocs::PostgresDialect)
        .build()
        .await
        .unwrap();

    let script = store.schema_script().unwrap();
    assert!(script.iter().any(|sql| sql.contains("\"PostsByDay_Document\"")));
    assert!(script.iter().all(|sql| !sql.contains('?')));
    assert!(script[0].starts_with("CREATE TABLE"));
}
