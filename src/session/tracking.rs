//! Change tracking: the identity map and the per-entity state machine.
//!
//! ```text
//! New ──flush──> Persisted ──update──> Modified ──flush──> Persisted
//!                    │                    │
//!                    └──────delete────────┴──> Removed ──flush──> (untracked)
//! ```
//!
//! States only advance through [`Tracker::apply`], after the flush commits.

use crate::command::{Command, CommandKind, Expectation};
use crate::connection::{Filter, Statement};
use crate::content::ContentSerializer;
use crate::core::{DbError, Result, Value};
use crate::document::{DocumentId, EntityCell};
use crate::index::DocumentChange;
use crate::index::layout::{CONTENT, ID, TYPE, VERSION};
use crate::index::StoreLayout;
use std::collections::BTreeMap;
use std::sync::Arc;

type JsonValue = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    New,
    Persisted,
    Modified,
    Removed,
}

pub(crate) struct TrackedEntry {
    pub type_name: String,
    pub state: EntityState,
    /// Version of the persisted row; 0 while new
    pub version: i64,
    /// Content as last persisted
    pub persisted: Option<JsonValue>,
    pub cell: Arc<dyn EntityCell>,
}

/// Outcome of a successful flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Entities marked for update whose content had not changed
    pub unchanged: usize,
    pub commands: usize,
    pub round_trips: usize,
}

impl FlushSummary {
    /// Whether the flush wrote anything
    pub fn is_empty(&self) -> bool {
        self.inserted + self.updated + self.deleted == 0
    }
}

pub(crate) enum Transition {
    Persisted {
        id: DocumentId,
        version: i64,
        content: JsonValue,
    },
    Forget(DocumentId),
}

/// Everything one flush writes, computed before any I/O
pub(crate) struct FlushPlan {
    pub changes: Vec<DocumentChange>,
    pub commands: Vec<Command>,
    pub transitions: Vec<Transition>,
    pub summary: FlushSummary,
}

#[derive(Default)]
pub(crate) struct Tracker {
    entries: BTreeMap<DocumentId, TrackedEntry>,
}

impl Tracker {
    pub fn get(&self, id: DocumentId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    pub fn track_new(&mut self, id: DocumentId, type_name: &str, cell: Arc<dyn EntityCell>) {
        self.entries.insert(
            id,
            TrackedEntry {
                type_name: type_name.to_string(),
                state: EntityState::New,
                version: 0,
                persisted: None,
                cell,
            },
        );
    }

    pub fn track_loaded(
        &mut self,
        id: DocumentId,
        type_name: &str,
        version: i64,
        content: JsonValue,
        cell: Arc<dyn EntityCell>,
    ) {
        self.entries.insert(
            id,
            TrackedEntry {
                type_name: type_name.to_string(),
                state: EntityState::Persisted,
                version,
                persisted: Some(content),
                cell,
            },
        );
    }

    /// Entry behind a handle; handles from other sessions count as untracked
    fn entry_mut(&mut self, id: DocumentId, address: *const ()) -> Result<&mut TrackedEntry> {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.cell.address() == address => Ok(entry),
            _ => Err(DbError::UntrackedEntity(id)),
        }
    }

    pub fn is_tracked(&self, id: DocumentId, address: *const ()) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.cell.address() == address)
    }

    pub fn mark_modified(&mut self, id: DocumentId, address: *const ()) -> Result<()> {
        let entry = self.entry_mut(id, address)?;
        match entry.state {
            EntityState::New | EntityState::Modified => Ok(()),
            EntityState::Persisted => {
                entry.state = EntityState::Modified;
                Ok(())
            }
            EntityState::Removed => Err(DbError::InvalidState(format!(
                "Document {} is pending removal",
                id
            ))),
        }
    }

    pub fn mark_removed(&mut self, id: DocumentId, address: *const ()) -> Result<()> {
        let entry = self.entry_mut(id, address)?;
        if entry.state == EntityState::New {
            self.entries.remove(&id);
        } else {
            entry.state = EntityState::Removed;
        }
        Ok(())
    }

    pub fn detach(&mut self, id: DocumentId, address: *const ()) -> Result<()> {
        self.entry_mut(id, address)?;
        self.entries.remove(&id);
        Ok(())
    }

    /// Drop pending changes: new entities are forgotten, the rest return to persisted
    pub fn cancel(&mut self) {
        self.entries.retain(|_, entry| entry.state != EntityState::New);
        for entry in self.entries.values_mut() {
            entry.state = EntityState::Persisted;
        }
    }

    pub fn state(&self, id: DocumentId, address: *const ()) -> Option<EntityState> {
        self.entries
            .get(&id)
            .filter(|entry| entry.cell.address() == address)
            .map(|entry| entry.state)
    }

    pub fn version(&self, id: DocumentId, address: *const ()) -> Option<i64> {
        self.entries
            .get(&id)
            .filter(|entry| entry.cell.address() == address)
            .map(|entry| entry.version)
    }

    pub fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state != EntityState::Persisted)
            .count()
    }

    /// Document commands and index inputs for every pending entity, in id order
    pub fn plan(&self, layout: &StoreLayout, serializer: &dyn ContentSerializer) -> Result<FlushPlan> {
        let table = layout.document_table();
        let mut plan = FlushPlan {
            changes: Vec::new(),
            commands: Vec::new(),
            transitions: Vec::new(),
            summary: FlushSummary::default(),
        };

        for (&id, entry) in &self.entries {
            match entry.state {
                EntityState::Persisted => {}
                EntityState::New => {
                    let content = entry.cell.snapshot()?;
                    plan.commands.push(Command::insert(
                        CommandKind::InsertDocument,
                        table,
                        vec![ID.into(), TYPE.into(), CONTENT.into(), VERSION.into()],
                        vec![
                            Value::Integer(id),
                            Value::Text(entry.type_name.clone()),
                            Value::Text(serializer.serialize(&content)?),
                            Value::Integer(1),
                        ],
                        id,
                    ));
                    plan.changes.push(DocumentChange {
                        id,
                        type_name: entry.type_name.clone(),
                        before: None,
                        after: Some(content.clone()),
                    });
                    plan.transitions.push(Transition::Persisted {
                        id,
                        version: 1,
                        content,
                    });
                    plan.summary.inserted += 1;
                }
                EntityState::Modified => {
                    let content = entry.cell.snapshot()?;
                    if entry.persisted.as_ref() == Some(&content) {
                        plan.transitions.push(Transition::Persisted {
                            id,
                            version: entry.version,
                            content,
                        });
                        plan.summary.unchanged += 1;
                        continue;
                    }

                    plan.commands.push(Command::new(
                        CommandKind::UpdateDocument,
                        Statement::update(
                            table,
                            vec![
                                (CONTENT.into(), Value::Text(serializer.serialize(&content)?)),
                                (VERSION.into(), Value::Integer(entry.version + 1)),
                            ],
                            Filter::new().eq(ID, id).eq(VERSION, entry.version),
                        ),
                        Expectation::One,
                        id,
                    ));
                    plan.changes.push(DocumentChange {
                        id,
                        type_name: entry.type_name.clone(),
                        before: entry.persisted.clone(),
                        after: Some(content.clone()),
                    });
                    plan.transitions.push(Transition::Persisted {
                        id,
                        version: entry.version + 1,
                        content,
                    });
                    plan.summary.updated += 1;
                }
                EntityState::Removed => {
                    plan.commands.push(Command::new(
                        CommandKind::DeleteDocument,
                        Statement::delete(table, Filter::new().eq(ID, id).eq(VERSION, entry.version)),
                        Expectation::One,
                        id,
                    ));
                    plan.changes.push(DocumentChange {
                        id,
                        type_name: entry.type_name.clone(),
                        before: entry.persisted.clone(),
                        after: None,
                    });
                    plan.transitions.push(Transition::Forget(id));
                    plan.summary.deleted += 1;
                }
            }
        }

        Ok(plan)
    }

    pub fn apply(&mut self, transitions: Vec<Transition>) {
        for transition in transitions {
            match transition {
                Transition::Persisted {
                    id,
                    version,
                    content,
                } => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.state = EntityState::Persisted;
                        entry.version = version;
                        entry.persisted = Some(content);
                    }
                }
                Transition::Forget(id) => {
                    self.entries.remove(&id);
                }
            }
        }
    }
}
