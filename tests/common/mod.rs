#![allow(dead_code)]

use memodocs::connection::Select;
use memodocs::{
    Column, Connection, DataType, Entity, InMemoryDB, IndexRecord, MapIndex, ReduceIndex, Row,
    Store, StoreBuilder,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub day: String,
    pub title: String,
    pub tags: Vec<String>,
}

impl Entity for Post {}

pub fn post(day: &str, title: &str, tags: &[&str]) -> Post {
    Post {
        day: day.to_string(),
        title: title.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
}

impl Entity for Author {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTag {
    pub tag: String,
}

impl IndexRecord for PostTag {
    fn columns() -> Vec<Column> {
        vec![Column::new("tag", DataType::Text).not_null()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayCount {
    pub day: String,
    pub count: i64,
}

impl IndexRecord for DayCount {
    fn columns() -> Vec<Column> {
        vec![
            Column::new("day", DataType::Text).not_null(),
            Column::new("count", DataType::Integer).not_null(),
        ]
    }
}

pub fn tags_index() -> MapIndex<Post, PostTag> {
    MapIndex::new("PostTags").map(|post: &Post| {
        post.tags
            .iter()
            .map(|tag| PostTag { tag: tag.clone() })
            .collect()
    })
}

fn count_posts(existing: Option<&DayCount>, entries: &[DayCount]) -> DayCount {
    DayCount {
        day: entries[0].day.clone(),
        count: existing.map_or(0, |e| e.count) + entries.iter().map(|e| e.count).sum::<i64>(),
    }
}

/// Posts per day, with an incremental delete
pub fn posts_by_day() -> ReduceIndex<Post, DayCount> {
    ReduceIndex::new("PostsByDay")
        .map(|post: &Post| {
            vec![DayCount {
                day: post.day.clone(),
                count: 1,
            }]
        })
        .group(|entry: &DayCount| entry.day.clone())
        .reduce(count_posts)
        .delete(|existing: &DayCount, removed: &[DayCount]| {
            let count = existing.count - removed.iter().map(|e| e.count).sum::<i64>();
            (count > 0).then(|| DayCount {
                day: existing.day.clone(),
                count,
            })
        })
}

/// Posts per day, recomputed from the remaining posts on removal
pub fn day_totals() -> ReduceIndex<Post, DayCount> {
    ReduceIndex::new("DayTotals")
        .map(|post: &Post| {
            vec![DayCount {
                day: post.day.clone(),
                count: 1,
            }]
        })
        .group(|entry: &DayCount| entry.day.clone())
        .reduce(count_posts)
}

pub fn builder(db: &InMemoryDB) -> StoreBuilder {
    Store::builder(db.clone())
        .register(tags_index())
        .register(posts_by_day())
        .register(day_totals())
}

pub async fn blog_store(db: &InMemoryDB) -> Store {
    builder(db).build().await.unwrap()
}

/// Committed rows of `table`, read outside any session
pub async fn raw_rows(db: &InMemoryDB, table: &str) -> Vec<Row> {
    let mut connection = db.open_connection();
    connection.query(&Select::from(table).into()).await.unwrap()
}
