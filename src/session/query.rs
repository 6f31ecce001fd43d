use super::Session;
use crate::connection::{CompareOp, Filter, OrderBy, Predicate};
use crate::core::{Result, Value};
use crate::document::{DocHandle, Entity};
use crate::index::IndexRecord;
use std::marker::PhantomData;

/// Filter, order and paging shared by both query builders
#[derive(Debug, Clone, Default)]
pub(crate) struct QuerySpec {
    pub index: Option<String>,
    pub filter: Filter,
    pub order_by: Vec<OrderBy>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl QuerySpec {
    fn compare(&mut self, column: String, op: CompareOp, value: Value) {
        self.filter.push(Predicate::Compare { column, op, value });
    }

    fn order(&mut self, column: String, descending: bool) {
        self.order_by.push(OrderBy { column, descending });
    }
}

/// Query over documents of type `T`.
///
/// Without an index, columns refer to the document table (`Id`, `Version`). With
/// [`with_index`](Self::with_index) they refer to the index's own columns and the
/// result is the documents behind the matching index rows, in index order.
///
/// Queries read committed state; pending changes of the session are not flushed first.
pub struct DocumentQuery<'s, T> {
    session: &'s mut Session,
    spec: QuerySpec,
    _marker: PhantomData<fn() -> T>,
}

impl<'s, T: Entity> DocumentQuery<'s, T> {
    pub(crate) fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            spec: QuerySpec::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.spec.index = Some(name.into());
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.spec.compare(column.into(), op, value.into());
        self
    }

    pub fn filter_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.spec.filter = self.spec.filter.is_in(column, values);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.spec.order(column.into(), false);
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.spec.order(column.into(), true);
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.spec.offset = Some(count);
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.spec.limit = Some(count);
        self
    }

    pub async fn list(self) -> Result<Vec<DocHandle<T>>> {
        self.session.query_documents::<T>(self.spec).await
    }

    pub async fn first(self) -> Result<Option<DocHandle<T>>> {
        Ok(self.take(1).list().await?.into_iter().next())
    }

    /// Number of matching documents, ignoring `skip`/`take`
    pub async fn count(self) -> Result<usize> {
        self.session.count_documents::<T>(self.spec).await
    }
}

/// Query over the rows of an index, returned as index records `E`.
pub struct IndexQuery<'s, E> {
    session: &'s mut Session,
    name: String,
    spec: QuerySpec,
    _marker: PhantomData<fn() -> E>,
}

impl<'s, E: IndexRecord> IndexQuery<'s, E> {
    pub(crate) fn new(session: &'s mut Session, name: String) -> Self {
        Self {
            session,
            name,
            spec: QuerySpec::default(),
            _marker: PhantomData,
        }
    }

    pub fn filter(mut self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.spec.compare(column.into(), op, value.into());
        self
    }

    pub fn filter_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.spec.filter = self.spec.filter.is_in(column, values);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.spec.order(column.into(), false);
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.spec.order(column.into(), true);
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.spec.offset = Some(count);
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.spec.limit = Some(count);
        self
    }

    pub async fn list(self) -> Result<Vec<E>> {
        self.session.query_index_rows::<E>(&self.name, self.spec).await
    }

    pub async fn first(self) -> Result<Option<E>> {
        Ok(self.take(1).list().await?.into_iter().next())
    }

    pub async fn count(self) -> Result<usize> {
        self.session.count_index_rows(&self.name, self.spec).await
    }
}
