// ============================================================================
// Index maintenance engine
// ============================================================================
//
// Turns the documents changed by a flush into index commands.
//
// Map indexes: a document whose mapped entries changed loses all its rows
// and gets one row per new entry.
//
// Reduce indexes: per group key, every changed document's old entries are
// taken out of the aggregate (Delete, or a recompute from the remaining
// contributors) and its new entries folded in (Reduce). All changes to one
// key within a flush share a single slot, so a key emptied by one document
// and refilled by another ends up as one update of the same row.
//
// Reads (current aggregate rows, bridge entries, contributor content) run
// on the flush's connection, inside its transaction.
//
// ============================================================================

use super::definition::{entry_to_row, row_to_entry};
use super::layout::{CONTENT, DOCUMENT_ID, GROUP_KEY, ID, INDEX_ID, VERSION, prefix_width};
use super::{IndexDefinition, IndexRegistry, ReduceDefinition, StoreLayout};
use crate::command::{Command, CommandKind, Expectation};
use crate::connection::{Connection, Filter, Select, Statement};
use crate::content::ContentSerializer;
use crate::core::{DbError, Result, Value};
use crate::document::DocumentId;
use crate::store::IdGenerator;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{Level, event};

type JsonValue = serde_json::Value;

/// A document touched by a flush.
///
/// `before` is the last persisted content (absent for new documents), `after` the
/// content being written (absent for deletions).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub id: DocumentId,
    pub type_name: String,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

/// Entries of one document grouped by key string
type Grouped = BTreeMap<String, (Value, Vec<JsonValue>)>;

/// Net change to one aggregate row
struct Slot {
    key: Value,
    removed: Vec<JsonValue>,
    added: Vec<JsonValue>,
    leaving: Vec<DocumentId>,
    joining: Vec<DocumentId>,
    changed: BTreeSet<DocumentId>,
}

impl Slot {
    fn new(key: Value) -> Self {
        Self {
            key,
            removed: Vec::new(),
            added: Vec::new(),
            leaving: Vec::new(),
            joining: Vec::new(),
            changed: BTreeSet::new(),
        }
    }

    fn first_changed(&self) -> DocumentId {
        self.changed.iter().next().copied().unwrap_or_default()
    }
}

/// Persisted aggregate row
struct Aggregate {
    id: i64,
    version: i64,
    entry: JsonValue,
}

pub struct IndexEngine<'a> {
    registry: &'a IndexRegistry,
    layout: &'a StoreLayout,
    ids: &'a IdGenerator,
    serializer: &'a dyn ContentSerializer,
}

impl<'a> IndexEngine<'a> {
    pub fn new(
        registry: &'a IndexRegistry,
        layout: &'a StoreLayout,
        ids: &'a IdGenerator,
        serializer: &'a dyn ContentSerializer,
    ) -> Self {
        Self {
            registry,
            layout,
            ids,
            serializer,
        }
    }

    /// Commands that bring every index in line with `changes`
    pub async fn plan(
        &self,
        connection: &mut dyn Connection,
        changes: &[DocumentChange],
    ) -> Result<Vec<Command>> {
        let mut commands = Vec::new();

        for definition in self.registry.iter() {
            let relevant: Vec<&DocumentChange> = changes
                .iter()
                .filter(|c| c.type_name == definition.document_type())
                .collect();
            if relevant.is_empty() {
                continue;
            }

            let before = commands.len();
            match definition {
                IndexDefinition::Map(_) => self.plan_map(definition, &relevant, &mut commands)?,
                IndexDefinition::Reduce(reduce) => {
                    self.plan_reduce(connection, definition, reduce, &relevant, &mut commands)
                        .await?
                }
            }
            event!(
                Level::DEBUG,
                index = definition.name(),
                documents = relevant.len(),
                commands = commands.len() - before,
                "index planned"
            );
        }

        Ok(commands)
    }

    fn plan_map(
        &self,
        definition: &IndexDefinition,
        changes: &[&DocumentChange],
        commands: &mut Vec<Command>,
    ) -> Result<()> {
        let table = self.layout.index_table(definition);
        let columns = self.layout.index_columns(definition);

        for change in changes {
            let old = map_content(definition, change.before.as_ref())?;
            let new = map_content(definition, change.after.as_ref())?;
            if old == new {
                continue;
            }

            if !old.is_empty() {
                commands.push(Command::new(
                    CommandKind::DeleteMapRows,
                    Statement::delete(&table, Filter::new().eq(DOCUMENT_ID, change.id)),
                    Expectation::Any,
                    change.id,
                ));
            }
            for entry in &new {
                let mut values = vec![Value::Integer(self.ids.next(&table)?), Value::Integer(change.id)];
                values.extend(entry_to_row(definition.columns(), entry)?);
                commands.push(Command::insert(
                    CommandKind::InsertMapRow,
                    &table,
                    columns.clone(),
                    values,
                    change.id,
                ));
            }
        }
        Ok(())
    }

    async fn plan_reduce(
        &self,
        connection: &mut dyn Connection,
        definition: &IndexDefinition,
        reduce: &ReduceDefinition,
        changes: &[&DocumentChange],
        commands: &mut Vec<Command>,
    ) -> Result<()> {
        let mut slots: BTreeMap<String, Slot> = BTreeMap::new();

        for change in changes {
            let old = group_content(definition, reduce, change.before.as_ref())?;
            let new = group_content(definition, reduce, change.after.as_ref())?;
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

            for key in keys {
                let old_group = old.get(key);
                let new_group = new.get(key);
                let removed = old_group.map_or(&[][..], |(_, entries)| entries.as_slice());
                let added = new_group.map_or(&[][..], |(_, entries)| entries.as_slice());
                if removed == added {
                    continue;
                }

                let Some((key_value, _)) = old_group.or(new_group) else {
                    continue;
                };
                let slot = slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::new(key_value.clone()));
                slot.removed.extend_from_slice(removed);
                slot.added.extend_from_slice(added);
                slot.changed.insert(change.id);
                match (removed.is_empty(), added.is_empty()) {
                    (false, true) => slot.leaving.push(change.id),
                    (true, false) => slot.joining.push(change.id),
                    _ => {}
                }
            }
        }

        for (key, slot) in slots {
            self.apply_slot(connection, definition, reduce, &key, slot, commands)
                .await?;
        }
        Ok(())
    }

    async fn apply_slot(
        &self,
        connection: &mut dyn Connection,
        definition: &IndexDefinition,
        reduce: &ReduceDefinition,
        key: &str,
        slot: Slot,
        commands: &mut Vec<Command>,
    ) -> Result<()> {
        let table = self.layout.index_table(definition);
        let existing = self.load_aggregate(connection, definition, key).await?;
        let mut state = existing.as_ref().map(|a| a.entry.clone());

        if !slot.removed.is_empty() {
            let Some(aggregate) = &existing else {
                // The row these contributions were folded into is gone
                return Err(DbError::ConcurrencyConflict {
                    table,
                    id: slot.first_changed(),
                });
            };

            let remaining: Vec<DocumentId> = self
                .contributors(connection, definition, aggregate.id)
                .await?
                .into_iter()
                .filter(|id| !slot.changed.contains(id))
                .collect();

            state = match &reduce.delete {
                Some(delete) => {
                    let result = delete(&aggregate.entry, &slot.removed)?;
                    if result.is_none() && !remaining.is_empty() {
                        return Err(DbError::DefinitionViolation(format!(
                            "Index '{}' deleted the row for key {} which still has {} contributor(s)",
                            definition.name(),
                            slot.key,
                            remaining.len()
                        )));
                    }
                    result
                }
                None => {
                    self.recompute(connection, definition, reduce, key, &remaining)
                        .await?
                }
            };

            if remaining.is_empty() && slot.added.is_empty() {
                state = None;
            }
        }

        if !slot.added.is_empty() {
            state = Some((reduce.reduce)(state.as_ref(), &slot.added)?);
        }

        let bridge = self.layout.bridge_table(definition);
        let bridge_columns = vec![DOCUMENT_ID.to_string(), INDEX_ID.to_string()];

        match (existing, state) {
            (Some(aggregate), Some(entry)) => {
                for document in &slot.leaving {
                    commands.push(Command::new(
                        CommandKind::DeleteBridges,
                        Statement::delete(
                            &bridge,
                            Filter::new().eq(DOCUMENT_ID, *document).eq(INDEX_ID, aggregate.id),
                        ),
                        Expectation::One,
                        *document,
                    ));
                }

                let membership_changed = !slot.leaving.is_empty() || !slot.joining.is_empty();
                if entry != aggregate.entry || membership_changed {
                    let mut assignments: Vec<(String, Value)> = definition
                        .columns()
                        .iter()
                        .map(|c| c.name.clone())
                        .zip(entry_to_row(definition.columns(), &entry)?)
                        .collect();
                    assignments.push((VERSION.to_string(), Value::Integer(aggregate.version + 1)));
                    commands.push(Command::new(
                        CommandKind::UpdateReduceRow,
                        Statement::update(
                            &table,
                            assignments,
                            Filter::new().eq(ID, aggregate.id).eq(VERSION, aggregate.version),
                        ),
                        Expectation::One,
                        aggregate.id,
                    ));
                }

                for document in &slot.joining {
                    commands.push(Command::insert(
                        CommandKind::InsertBridge,
                        &bridge,
                        bridge_columns.clone(),
                        vec![Value::Integer(*document), Value::Integer(aggregate.id)],
                        *document,
                    ));
                }
            }
            (Some(aggregate), None) => {
                commands.push(Command::new(
                    CommandKind::DeleteBridges,
                    Statement::delete(&bridge, Filter::new().eq(INDEX_ID, aggregate.id)),
                    Expectation::Any,
                    aggregate.id,
                ));
                commands.push(Command::new(
                    CommandKind::DeleteReduceRow,
                    Statement::delete(
                        &table,
                        Filter::new().eq(ID, aggregate.id).eq(VERSION, aggregate.version),
                    ),
                    Expectation::One,
                    aggregate.id,
                ));
            }
            (None, Some(entry)) => {
                let id = self.ids.next(&table)?;
                let mut values = vec![
                    Value::Integer(id),
                    Value::Text(key.to_string()),
                    Value::Integer(1),
                ];
                values.extend(entry_to_row(definition.columns(), &entry)?);
                commands.push(Command::insert(
                    CommandKind::InsertReduceRow,
                    &table,
                    self.layout.index_columns(definition),
                    values,
                    id,
                ));
                for document in &slot.joining {
                    commands.push(Command::insert(
                        CommandKind::InsertBridge,
                        &bridge,
                        bridge_columns.clone(),
                        vec![Value::Integer(*document), Value::Integer(id)],
                        *document,
                    ));
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn load_aggregate(
        &self,
        connection: &mut dyn Connection,
        definition: &IndexDefinition,
        key: &str,
    ) -> Result<Option<Aggregate>> {
        let select = Select::from(self.layout.index_table(definition))
            .filter(Filter::new().eq(GROUP_KEY, key));
        let rows = connection.query(&select.into()).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let width = prefix_width(definition);
        let (Some(id), Some(version)) = (row[0].as_i64(), row[2].as_i64()) else {
            return Err(DbError::TypeMismatch(format!(
                "Malformed aggregate row for key {} in index '{}'",
                key,
                definition.name()
            )));
        };
        Ok(Some(Aggregate {
            id,
            version,
            entry: row_to_entry(definition.columns(), &row[width..]),
        }))
    }

    /// Documents currently bridged to aggregate row `index_id`
    async fn contributors(
        &self,
        connection: &mut dyn Connection,
        definition: &IndexDefinition,
        index_id: i64,
    ) -> Result<BTreeSet<DocumentId>> {
        let select = Select::from(self.layout.bridge_table(definition))
            .columns(&[DOCUMENT_ID])
            .filter(Filter::new().eq(INDEX_ID, index_id));
        let rows = connection.query(&select.into()).await?;
        Ok(rows.iter().filter_map(|row| row[0].as_i64()).collect())
    }

    /// Fold the stored entries of `documents` for `key` from scratch
    async fn recompute(
        &self,
        connection: &mut dyn Connection,
        definition: &IndexDefinition,
        reduce: &ReduceDefinition,
        key: &str,
        documents: &[DocumentId],
    ) -> Result<Option<JsonValue>> {
        if documents.is_empty() {
            return Ok(None);
        }

        let select = Select::from(self.layout.document_table())
            .columns(&[ID, CONTENT])
            .filter(Filter::new().is_in(ID, documents.iter().map(|id| Value::Integer(*id)).collect()))
            .order_by(ID, false);
        let rows = connection.query(&select.into()).await?;

        let mut entries = Vec::new();
        for row in rows {
            let Some(text) = row[1].as_str() else {
                continue;
            };
            let content = self.serializer.deserialize(text)?;
            let mut grouped = group_content(definition, reduce, Some(&content))?;
            if let Some((_, contributed)) = grouped.remove(key) {
                entries.extend(contributed);
            }
        }

        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some((reduce.reduce)(None, &entries)?))
    }
}

fn map_content(definition: &IndexDefinition, content: Option<&JsonValue>) -> Result<Vec<JsonValue>> {
    match content {
        Some(content) => definition.map(content),
        None => Ok(Vec::new()),
    }
}

fn group_content(
    definition: &IndexDefinition,
    reduce: &ReduceDefinition,
    content: Option<&JsonValue>,
) -> Result<Grouped> {
    let mut grouped = Grouped::new();
    for entry in map_content(definition, content)? {
        let key = (reduce.group)(&entry)?;
        grouped
            .entry(key.to_key_string())
            .or_insert_with(|| (key, Vec::new()))
            .1
            .push(entry);
    }
    Ok(grouped)
}
