// ============================================================================
// Session (unit of work)
// ============================================================================
//
// A session owns an identity map of tracked entities and one backend
// connection, opened on first use. `save`, `update`, `delete`, `detach`
// and `cancel` only touch memory; `save_changes` turns pending changes
// into ordered commands and runs them in one transaction. Tracked state
// advances only after that transaction commits.
//
// A session is single-owner (`&mut self` everywhere); concurrency between
// sessions is left to the backend isolation level.
//
// ============================================================================

pub mod query;
pub mod tracking;

pub use query::{DocumentQuery, IndexQuery};
pub use tracking::{EntityState, FlushSummary};

use crate::command::{Command, CommandPipeline, PipelineStats};
use crate::connection::{Connection, Filter, OrderBy, Select};
use crate::core::{DbError, Result, Row, Value};
use crate::document::{DocHandle, DocumentId, Entity};
use crate::index::definition::row_to_entry;
use crate::index::layout::{DOCUMENT_ID, ID, INDEX_ID, TYPE, prefix_width};
use crate::index::{DocumentChange, IndexDefinition, IndexEngine, IndexRecord};
use crate::store::StoreInner;
use query::QuerySpec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use tracking::Tracker;
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    store: Arc<StoreInner>,
    connection: Option<Box<dyn Connection>>,
    tracker: Tracker,
}

impl Session {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            connection: None,
            tracker: Tracker::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The session's connection, opened on first use
    async fn connection(&mut self) -> Result<&mut dyn Connection> {
        if self.connection.is_none() {
            self.connection = Some(self.store.factory.connect().await?);
        }
        self.connection
            .as_deref_mut()
            .map(|c| -> &mut dyn Connection { c })
            .ok_or_else(|| DbError::InvalidState("Connection unavailable".into()))
    }

    /// Take the connection out of the session for the length of a flush.
    ///
    /// If the flush future is dropped before it hands the connection back, the
    /// connection is dropped with it and its open transaction is rolled back.
    async fn checkout(&mut self) -> Result<Box<dyn Connection>> {
        match self.connection.take() {
            Some(connection) => Ok(connection),
            None => self.store.factory.connect().await,
        }
    }

    // ========================================
    // Loading
    // ========================================

    /// Load a document. Repeated loads return handles to the same instance.
    ///
    /// Returns `None` for unknown ids and for documents pending removal in this session.
    pub async fn get<T: Entity>(&mut self, id: DocumentId) -> Result<Option<DocHandle<T>>> {
        if self.tracker.get(id).is_some() {
            return self.tracked_handle(id);
        }

        let select = Select::from(self.store.layout.document_table()).filter(Filter::new().eq(ID, id));
        let rows = self.connection().await?.query(&select.into()).await?;
        match rows.first() {
            Some(row) => self.materialize(row),
            None => Ok(None),
        }
    }

    /// Load several documents, in request order, skipping ids that do not exist
    pub async fn get_many<T: Entity>(&mut self, ids: &[DocumentId]) -> Result<Vec<DocHandle<T>>> {
        let missing: Vec<Value> = ids
            .iter()
            .filter(|id| self.tracker.get(**id).is_none())
            .map(|id| Value::Integer(*id))
            .collect();

        let mut rows: HashMap<DocumentId, Row> = HashMap::new();
        if !missing.is_empty() {
            let select = Select::from(self.store.layout.document_table())
                .filter(Filter::new().is_in(ID, missing));
            for row in self.connection().await?.query(&select.into()).await? {
                if let Some(id) = row[0].as_i64() {
                    rows.insert(id, row);
                }
            }
        }

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let handle = match rows.remove(id) {
                Some(row) => self.materialize(&row)?,
                None if self.tracker.get(*id).is_some() => self.tracked_handle(*id)?,
                None => None,
            };
            handles.extend(handle);
        }
        Ok(handles)
    }

    fn tracked_handle<T: Entity>(&self, id: DocumentId) -> Result<Option<DocHandle<T>>> {
        let Some(entry) = self.tracker.get(id) else {
            return Ok(None);
        };
        if entry.state == EntityState::Removed {
            return Ok(None);
        }
        if entry.type_name != T::type_name() {
            return Err(type_mismatch::<T>(id, &entry.type_name));
        }
        DocHandle::from_cell(id, Arc::clone(&entry.cell))
            .map(Some)
            .ok_or_else(|| type_mismatch::<T>(id, &entry.type_name))
    }

    /// Turn a document row into a tracked handle, going through the identity map
    fn materialize<T: Entity>(&mut self, row: &Row) -> Result<Option<DocHandle<T>>> {
        let (Some(id), Some(type_name), Some(text), Some(version)) = (
            row[0].as_i64(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_i64(),
        ) else {
            return Err(DbError::TypeMismatch("Malformed document row".into()));
        };

        if self.tracker.get(id).is_some() {
            return self.tracked_handle(id);
        }
        if type_name != T::type_name() {
            return Err(type_mismatch::<T>(id, type_name));
        }

        let content = self.store.serializer.deserialize(text)?;
        let entity: T = serde_json::from_value(content.clone())?;
        let handle = DocHandle::new(id, entity);
        self.tracker
            .track_loaded(id, type_name, version, content, handle.cell());
        Ok(Some(handle))
    }

    // ========================================
    // Change tracking
    // ========================================

    /// Track a new entity. Its id is assigned now; the row is written on flush.
    pub fn save<T: Entity>(&mut self, entity: T) -> Result<DocHandle<T>> {
        let id = self.store.ids.next(self.store.layout.document_table())?;
        let handle = DocHandle::new(id, entity);
        self.tracker.track_new(id, T::type_name(), handle.cell());
        Ok(handle)
    }

    /// Schedule a tracked entity's current state to be written on flush
    pub fn update<T: Entity>(&mut self, handle: &DocHandle<T>) -> Result<()> {
        self.tracker.mark_modified(handle.id(), handle.address())
    }

    /// Schedule removal. A new entity is simply forgotten.
    pub fn delete<T: Entity>(&mut self, handle: &DocHandle<T>) -> Result<()> {
        self.tracker.mark_removed(handle.id(), handle.address())
    }

    /// Stop tracking an entity without writing anything
    pub fn detach<T: Entity>(&mut self, handle: &DocHandle<T>) -> Result<()> {
        self.tracker.detach(handle.id(), handle.address())
    }

    /// Drop all pending changes. In-memory values are left as they are.
    pub fn cancel(&mut self) {
        self.tracker.cancel();
    }

    pub fn state<T: Entity>(&self, handle: &DocHandle<T>) -> Option<EntityState> {
        self.tracker.state(handle.id(), handle.address())
    }

    /// Persisted version of a tracked entity (0 while new)
    pub fn version<T: Entity>(&self, handle: &DocHandle<T>) -> Option<i64> {
        self.tracker.version(handle.id(), handle.address())
    }

    pub fn is_tracked<T: Entity>(&self, handle: &DocHandle<T>) -> bool {
        self.tracker.is_tracked(handle.id(), handle.address())
    }

    pub fn has_changes(&self) -> bool {
        self.tracker.pending() > 0
    }

    // ========================================
    // Flush
    // ========================================

    /// Write all pending changes in one transaction.
    ///
    /// On error the transaction is rolled back and every tracked entity keeps the
    /// state it had before the call. A [`DbError::ConcurrencyConflict`] means another
    /// session got there first: retry the operation in a new session.
    ///
    /// Dropping the returned future before it completes drops the session's
    /// connection as well, which rolls back the open transaction and releases
    /// anything it held (including the serializable write lock of [`InMemoryDB`]).
    /// The next operation opens a fresh connection.
    ///
    /// [`InMemoryDB`]: crate::InMemoryDB
    pub async fn save_changes(&mut self) -> Result<FlushSummary> {
        let store = Arc::clone(&self.store);
        let span = info_span!("flush", session = %self.id);
        store.config.scope(self.flush().instrument(span)).await
    }

    async fn flush(&mut self) -> Result<FlushSummary> {
        let mut plan = self
            .tracker
            .plan(&self.store.layout, self.store.serializer.as_ref())?;
        let mut summary = plan.summary;

        if plan.changes.is_empty() {
            self.tracker.apply(plan.transitions);
            return Ok(summary);
        }

        let store = Arc::clone(&self.store);
        let commands = std::mem::take(&mut plan.commands);
        let mut connection = self.checkout().await?;
        let outcome = Self::write(&store, connection.as_mut(), commands, &plan.changes).await;
        self.connection = Some(connection);

        let stats = outcome?;
        self.tracker.apply(plan.transitions);
        summary.commands = stats.commands;
        summary.round_trips = stats.round_trips;
        event!(
            Level::DEBUG,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            commands = summary.commands,
            "flush committed"
        );
        Ok(summary)
    }

    /// Run one flush transaction: document commands, then index maintenance
    async fn write(
        store: &StoreInner,
        connection: &mut dyn Connection,
        mut commands: Vec<Command>,
        changes: &[DocumentChange],
    ) -> Result<PipelineStats> {
        connection.begin(store.config.isolation_level).await?;

        let outcome = async {
            let engine = IndexEngine::new(
                &store.registry,
                &store.layout,
                &store.ids,
                store.serializer.as_ref(),
            );
            commands.extend(engine.plan(&mut *connection, changes).await?);
            CommandPipeline::new(store.dialect.as_ref(), store.config.command_batch_size)
                .execute(&mut *connection, commands)
                .await
        }
        .await;

        match outcome {
            Ok(stats) => {
                connection.commit().await?;
                Ok(stats)
            }
            Err(err) => {
                if let Err(rollback) = connection.rollback().await {
                    event!(Level::ERROR, error = %rollback, "rollback failed");
                }
                event!(Level::WARN, error = %err, "flush rolled back");
                if err.is_conflict() {
                    // Ids may have been taken by another store on this backend
                    if let Err(sync) = store.sync_ids(connection).await {
                        event!(Level::WARN, error = %sync, "id resync failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Dispose of the session, rolling back anything uncommitted
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take()
            && connection.in_transaction()
        {
            connection.rollback().await?;
        }
        Ok(())
    }

    // ========================================
    // Queries
    // ========================================

    pub fn query<T: Entity>(&mut self) -> DocumentQuery<'_, T> {
        DocumentQuery::new(self)
    }

    pub fn query_index<E: IndexRecord>(&mut self, name: impl Into<String>) -> IndexQuery<'_, E> {
        IndexQuery::new(self, name.into())
    }

    fn definition_for<T: Entity>(&self, name: &str) -> Result<IndexDefinition> {
        let definition = self.store.registry.get(name)?;
        if definition.document_type() != T::type_name() {
            return Err(DbError::InvalidState(format!(
                "Index '{}' indexes '{}', not '{}'",
                name,
                definition.document_type(),
                T::type_name()
            )));
        }
        Ok(definition.clone())
    }

    pub(crate) async fn query_documents<T: Entity>(&mut self, spec: QuerySpec) -> Result<Vec<DocHandle<T>>> {
        let store = Arc::clone(&self.store);
        let span = info_span!("query", session = %self.id, document_type = T::type_name());
        store
            .config
            .scope(self.run_document_query::<T>(spec).instrument(span))
            .await
    }

    async fn run_document_query<T: Entity>(&mut self, spec: QuerySpec) -> Result<Vec<DocHandle<T>>> {
        let document_table = self.store.layout.document_table().to_string();

        let rows = match &spec.index {
            None => {
                let mut select =
                    Select::from(&document_table).filter(spec.filter.clone().eq(TYPE, T::type_name()));
                select.order_by = order_or_id(&spec.order_by);
                select.offset = spec.offset;
                select.limit = spec.limit;
                self.connection().await?.query(&select.into()).await?
            }
            Some(name) => {
                let definition = self.definition_for::<T>(name)?;
                let ids: Vec<Value> = self
                    .indexed_documents(&definition, &spec)
                    .await?
                    .into_iter()
                    .skip(spec.offset.unwrap_or(0))
                    .take(spec.limit.unwrap_or(usize::MAX))
                    .map(Value::Integer)
                    .collect();
                if ids.is_empty() {
                    return Ok(Vec::new());
                }

                let select = Select::from(&document_table).filter(Filter::new().is_in(ID, ids.clone()));
                let mut by_id: HashMap<i64, Row> = self
                    .connection()
                    .await?
                    .query(&select.into())
                    .await?
                    .into_iter()
                    .filter_map(|row| row[0].as_i64().map(|id| (id, row)))
                    .collect();
                ids.iter()
                    .filter_map(|id| id.as_i64().and_then(|id| by_id.remove(&id)))
                    .collect()
            }
        };

        let mut handles = Vec::with_capacity(rows.len());
        for row in &rows {
            handles.extend(self.materialize::<T>(row)?);
        }
        event!(Level::DEBUG, results = handles.len(), "documents queried");
        Ok(handles)
    }

    pub(crate) async fn count_documents<T: Entity>(&mut self, spec: QuerySpec) -> Result<usize> {
        match &spec.index {
            None => {
                let select = Select::from(self.store.layout.document_table())
                    .filter(spec.filter.clone().eq(TYPE, T::type_name()))
                    .count();
                let rows = self.connection().await?.query(&select.into()).await?;
                Ok(count_of(&rows))
            }
            Some(name) => {
                let definition = self.definition_for::<T>(name)?;
                Ok(self.indexed_documents(&definition, &spec).await?.len())
            }
        }
    }

    /// Ids of the documents behind the index rows matching `spec`, in index order
    async fn indexed_documents(
        &mut self,
        definition: &IndexDefinition,
        spec: &QuerySpec,
    ) -> Result<Vec<DocumentId>> {
        let table = self.store.layout.index_table(definition);
        let mut seen = HashSet::new();

        match definition {
            IndexDefinition::Map(_) => {
                let mut select = Select::from(&table)
                    .columns(&[DOCUMENT_ID])
                    .filter(spec.filter.clone());
                select.order_by = spec.order_by.clone();
                let rows = self.connection().await?.query(&select.into()).await?;
                Ok(rows
                    .iter()
                    .filter_map(|row| row[0].as_i64())
                    .filter(|id| seen.insert(*id))
                    .collect())
            }
            IndexDefinition::Reduce(_) => {
                let mut select = Select::from(&table).columns(&[ID]).filter(spec.filter.clone());
                select.order_by = spec.order_by.clone();
                let aggregate_ids: Vec<Value> = self
                    .connection()
                    .await?
                    .query(&select.into())
                    .await?
                    .into_iter()
                    .map(|mut row| row.swap_remove(0))
                    .collect();
                if aggregate_ids.is_empty() {
                    return Ok(Vec::new());
                }

                let bridges = Select::from(self.store.layout.bridge_table(definition))
                    .columns(&[INDEX_ID, DOCUMENT_ID])
                    .filter(Filter::new().is_in(INDEX_ID, aggregate_ids.clone()))
                    .order_by(DOCUMENT_ID, false);
                let mut contributors: HashMap<i64, Vec<i64>> = HashMap::new();
                for row in self.connection().await?.query(&bridges.into()).await? {
                    if let (Some(index_id), Some(document_id)) = (row[0].as_i64(), row[1].as_i64()) {
                        contributors.entry(index_id).or_default().push(document_id);
                    }
                }

                Ok(aggregate_ids
                    .iter()
                    .filter_map(Value::as_i64)
                    .flat_map(|id| contributors.remove(&id).unwrap_or_default())
                    .filter(|id| seen.insert(*id))
                    .collect())
            }
        }
    }

    pub(crate) async fn query_index_rows<E: IndexRecord>(
        &mut self,
        name: &str,
        spec: QuerySpec,
    ) -> Result<Vec<E>> {
        let store = Arc::clone(&self.store);
        let span = info_span!("query", session = %self.id, index = name);
        store
            .config
            .scope(self.run_index_query::<E>(name, spec).instrument(span))
            .await
    }

    async fn run_index_query<E: IndexRecord>(&mut self, name: &str, spec: QuerySpec) -> Result<Vec<E>> {
        let definition = self.store.registry.get(name)?.clone();
        let mut select = Select::from(self.store.layout.index_table(&definition)).filter(spec.filter);
        select.order_by = order_or_id(&spec.order_by);
        select.offset = spec.offset;
        select.limit = spec.limit;

        let rows = self.connection().await?.query(&select.into()).await?;
        let width = prefix_width(&definition);
        rows.iter()
            .map(|row| {
                let entry = row_to_entry(definition.columns(), &row[width..]);
                Ok(serde_json::from_value(entry)?)
            })
            .collect()
    }

    pub(crate) async fn count_index_rows(&mut self, name: &str, spec: QuerySpec) -> Result<usize> {
        let definition = self.store.registry.get(name)?;
        let select = Select::from(self.store.layout.index_table(definition))
            .filter(spec.filter)
            .count();
        let rows = self.connection().await?.query(&select.into()).await?;
        Ok(count_of(&rows))
    }
}

fn order_or_id(order_by: &[OrderBy]) -> Vec<OrderBy> {
    if order_by.is_empty() {
        vec![OrderBy {
            column: ID.to_string(),
            descending: false,
        }]
    } else {
        order_by.to_vec()
    }
}

fn count_of(rows: &[Row]) -> usize {
    rows.first()
        .and_then(|row| row.first())
        .and_then(Value::as_i64)
        .unwrap_or(0) as usize
}

fn type_mismatch<T: Entity>(id: DocumentId, stored: &str) -> DbError {
    DbError::TypeMismatch(format!(
        "Document {} is a '{}', not a '{}'",
        id,
        stored,
        T::type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InMemoryDB;
    use crate::store::{Store, StoreConfig};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Memo {
        body: String,
    }

    impl Entity for Memo {}

    async fn store(config: StoreConfig) -> Store {
        Store::builder(InMemoryDB::new())
            .config(config)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_batching_reduces_round_trips() {
        let batched = store(StoreConfig::new().command_batch_size(8)).await;
        let mut session = batched.create_session();
        for n in 0..10 {
            session.save(Memo { body: n.to_string() }).unwrap();
        }
        let summary = session.save_changes().await.unwrap();
        assert_eq!(summary.commands, 10);
        assert_eq!(summary.round_trips, 2);

        let unbatched = store(StoreConfig::new().command_batch_size(1)).await;
        let mut session = unbatched.create_session();
        for n in 0..3 {
            session.save(Memo { body: n.to_string() }).unwrap();
        }
        let summary = session.save_changes().await.unwrap();
        assert_eq!(summary.round_trips, 3);
    }

    #[tokio::test]
    async fn test_flush_with_explicit_dispatch() {
        let quiet = store(StoreConfig::new().dispatch(tracing::subscriber::NoSubscriber::default())).await;
        let mut session = quiet.create_session();
        let memo = session.save(Memo { body: "hi".into() }).unwrap();
        session.save_changes().await.unwrap();

        let mut reader = quiet.create_session();
        let loaded = reader.get::<Memo>(memo.id()).await.unwrap().unwrap();
        assert_eq!(loaded.read().body, "hi");
    }

    #[tokio::test]
    async fn test_connection_is_opened_lazily() {
        let store = store(StoreConfig::new()).await;
        let mut session = store.create_session();
        session.save(Memo { body: "pending".into() }).unwrap();
        assert!(session.connection.is_none());

        session.save_changes().await.unwrap();
        assert!(session.connection.is_some());
        session.close().await.unwrap();
    }
}
