use crate::connection::{Filter, OrderBy, Predicate};
use crate::core::{DbError, Result, Row, TableSchema, Value};
use crate::transaction::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvccRow {
    pub row: Row,
    pub xmin: u64,         // Transaction ID that created this row version
    pub xmax: Option<u64>, // Transaction ID that deleted/updated this row version
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    schema: TableSchema,
    rows: BTreeMap<usize, Vec<MvccRow>>,
    next_row_id: usize,
    indexes: HashMap<String, BTreeMap<Value, BTreeSet<usize>>>,
}

/// What a writer finds at the head of a version chain
enum Head<'a> {
    /// Nothing this writer may touch (invisible insert, deleted, or deleted by us)
    Absent,
    /// Another transaction holds the row; `committed` is the version it superseded
    Locked { committed: Option<&'a MvccRow> },
    /// Latest version, writable; `stale` when it was committed after our read snapshot
    Writable { index: usize, stale: bool },
    /// Deleted by a transaction that committed after our read snapshot
    DeletedAfterSnapshot(&'a MvccRow),
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        let indexes = schema
            .columns()
            .iter()
            .filter(|c| c.primary_key || c.unique || schema.is_indexed(&c.name))
            .map(|c| (c.name.clone(), BTreeMap::new()))
            .collect();

        Self {
            schema,
            rows: BTreeMap::new(),
            next_row_id: 0,
            indexes,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Bring `columns`/`values` into schema order, filling missing columns with NULL
    pub fn shape_row(&self, columns: &[String], values: Row) -> Result<Row> {
        if columns.len() != values.len() {
            return Err(DbError::ExecutionError(format!(
                "Expected {} values for table '{}', got {}",
                columns.len(),
                self.name(),
                values.len()
            )));
        }
        if columns.is_empty() {
            return Ok(values);
        }

        let mut row = vec![Value::Null; self.schema.column_count()];
        for (column, value) in columns.iter().zip(values) {
            let idx = self.schema.require_column(column)?;
            row[idx] = value;
        }
        Ok(row)
    }

    pub fn insert(&mut self, row: Row, writer: &Snapshot) -> Result<usize> {
        self.validate_row(&row)?;
        self.check_uniqueness(&row, None, writer)?;

        let id = self.next_row_id;
        self.next_row_id += 1;

        self.update_indexes(id, &row);
        self.rows.insert(
            id,
            vec![MvccRow {
                row,
                xmin: writer.tx_id,
                xmax: None,
            }],
        );

        Ok(id)
    }

    /// Visible rows matching `filter`, ordered and paged.
    pub fn select(
        &self,
        filter: &Filter,
        order_by: &[OrderBy],
        offset: Option<usize>,
        limit: Option<usize>,
        reader: &Snapshot,
    ) -> Result<Vec<Row>> {
        let bound = self.bind_filter(filter)?;
        let mut results = Vec::new();

        for id in self.candidates(&bound) {
            let Some(versions) = self.rows.get(&id) else {
                continue;
            };
            let visible = versions
                .iter()
                .rev()
                .find(|v| reader.is_visible(v.xmin, v.xmax));
            if let Some(version) = visible
                && Self::matches(&bound, &version.row)
            {
                results.push(version.row.clone());
            }
        }

        if !order_by.is_empty() {
            let keys = order_by
                .iter()
                .map(|o| Ok((self.schema.require_column(&o.column)?, o.descending)))
                .collect::<Result<Vec<_>>>()?;
            results.sort_by(|a, b| {
                keys.iter()
                    .map(|(idx, desc)| {
                        let ord = a[*idx].cmp(&b[*idx]);
                        if *desc { ord.reverse() } else { ord }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(usize::MAX);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    /// Update every row matching `filter`.
    ///
    /// The filter is evaluated against the latest committed version (read committed
    /// re-check), so `WHERE Version = ?` behaves as a compare-and-set.
    pub fn update(
        &mut self,
        filter: &Filter,
        assignments: &[(String, Value)],
        reader: &Snapshot,
        writer: &Snapshot,
    ) -> Result<u64> {
        let bound = self.bind_filter(filter)?;
        let positions = assignments
            .iter()
            .map(|(column, value)| Ok((self.schema.require_column(column)?, value.clone())))
            .collect::<Result<Vec<_>>>()?;

        let mut affected = 0;
        for id in self.candidates(&bound) {
            let Some(index) = self.writable_head(id, &bound, reader, writer)? else {
                continue;
            };

            let mut new_row = self.rows[&id][index].row.clone();
            for (idx, value) in &positions {
                new_row[*idx] = value.clone();
            }
            self.validate_row(&new_row)?;
            self.check_uniqueness(&new_row, Some(id), writer)?;

            if let Some(versions) = self.rows.get_mut(&id) {
                versions[index].xmax = Some(writer.tx_id);
                versions.push(MvccRow {
                    row: new_row.clone(),
                    xmin: writer.tx_id,
                    xmax: None,
                });
            }
            self.update_indexes(id, &new_row);
            affected += 1;
        }

        Ok(affected)
    }

    pub fn delete(&mut self, filter: &Filter, reader: &Snapshot, writer: &Snapshot) -> Result<u64> {
        let bound = self.bind_filter(filter)?;
        let mut affected = 0;

        for id in self.candidates(&bound) {
            let Some(index) = self.writable_head(id, &bound, reader, writer)? else {
                continue;
            };
            if let Some(versions) = self.rows.get_mut(&id) {
                versions[index].xmax = Some(writer.tx_id);
                affected += 1;
            }
        }

        Ok(affected)
    }

    /// Locate the version a write to row `id` applies to, raising write conflicts
    fn writable_head(
        &self,
        id: usize,
        bound: &[(usize, &Predicate)],
        reader: &Snapshot,
        writer: &Snapshot,
    ) -> Result<Option<usize>> {
        match self.head(id, reader, writer) {
            Head::Absent => Ok(None),
            Head::Locked { committed } => match committed {
                Some(version) if Self::matches(bound, &version.row) => {
                    Err(DbError::WriteConflict(self.name().to_string()))
                }
                _ => Ok(None),
            },
            Head::DeletedAfterSnapshot(version) => {
                if Self::matches(bound, &version.row) {
                    Err(DbError::WriteConflict(self.name().to_string()))
                } else {
                    Ok(None)
                }
            }
            Head::Writable { index, stale } => {
                let row = &self.rows[&id][index].row;
                if !Self::matches(bound, row) {
                    return Ok(None);
                }
                if stale {
                    return Err(DbError::WriteConflict(self.name().to_string()));
                }
                Ok(Some(index))
            }
        }
    }

    fn head(&self, id: usize, reader: &Snapshot, writer: &Snapshot) -> Head<'_> {
        let Some(versions) = self.rows.get(&id) else {
            return Head::Absent;
        };

        let mut live = versions
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, v)| !writer.is_aborted(v.xmin));

        let Some((index, latest)) = live.next() else {
            return Head::Absent;
        };

        if writer.is_in_flight(latest.xmin) {
            let committed = live.next().map(|(_, v)| v);
            return Head::Locked { committed };
        }

        if let Some(xmax) = latest.xmax {
            if xmax == writer.tx_id {
                return Head::Absent;
            }
            if writer.is_in_flight(xmax) {
                return Head::Locked {
                    committed: Some(latest),
                };
            }
            if writer.is_committed(xmax) {
                return if reader.tx_id == writer.tx_id
                    && !reader.is_committed(xmax)
                    && reader.is_visible(latest.xmin, None)
                {
                    Head::DeletedAfterSnapshot(latest)
                } else {
                    Head::Absent
                };
            }
        }

        let stale = latest.xmin != writer.tx_id && !reader.is_committed(latest.xmin);
        Head::Writable { index, stale }
    }

    fn check_uniqueness(&self, row: &Row, ignore_id: Option<usize>, writer: &Snapshot) -> Result<()> {
        for (col_idx, column) in self.schema.columns().iter().enumerate() {
            if !(column.primary_key || column.unique) {
                continue;
            }
            let value = &row[col_idx];
            if value.is_null() {
                continue;
            }

            let ids: Vec<usize> = match self.indexes.get(&column.name) {
                Some(index) => index
                    .get(value)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default(),
                None => self.rows.keys().copied().collect(),
            };

            for id in ids {
                if Some(id) == ignore_id {
                    continue;
                }
                let Some(versions) = self.rows.get(&id) else {
                    continue;
                };
                let Some(latest) = versions.iter().rev().find(|v| !writer.is_aborted(v.xmin)) else {
                    continue;
                };
                if &latest.row[col_idx] != value {
                    continue;
                }

                let deleted = match latest.xmax {
                    Some(xmax) if xmax == writer.tx_id => true,
                    Some(xmax) if writer.is_committed(xmax) => true,
                    Some(xmax) if writer.is_in_flight(xmax) => {
                        return Err(DbError::WriteConflict(self.name().to_string()));
                    }
                    _ => false,
                };
                if deleted {
                    continue;
                }
                if writer.is_in_flight(latest.xmin) {
                    return Err(DbError::WriteConflict(self.name().to_string()));
                }

                return Err(DbError::ConstraintViolation(format!(
                    "Unique constraint violation: Column '{}' of table '{}' already contains value {}",
                    column.name,
                    self.name(),
                    value
                )));
            }
        }
        Ok(())
    }

    fn bind_filter<'f>(&self, filter: &'f Filter) -> Result<Vec<(usize, &'f Predicate)>> {
        filter
            .predicates()
            .iter()
            .map(|p| Ok((self.schema.require_column(p.column())?, p)))
            .collect()
    }

    fn matches(bound: &[(usize, &Predicate)], row: &Row) -> bool {
        bound.iter().all(|(idx, predicate)| predicate.matches(&row[*idx]))
    }

    /// Row ids worth checking: an index lookup when an equality predicate allows it
    fn candidates(&self, bound: &[(usize, &Predicate)]) -> Vec<usize> {
        for (idx, predicate) in bound {
            let column = &self.schema.columns()[*idx].name;
            if let (Some(index), Some(values)) = (self.indexes.get(column), predicate.lookup_values()) {
                let ids: BTreeSet<usize> = values
                    .into_iter()
                    .filter_map(|v| index.get(v))
                    .flat_map(|ids| ids.iter().copied())
                    .collect();
                return ids.into_iter().collect();
            }
        }
        self.rows.keys().copied().collect()
    }

    /// Number of row chains, including versions not yet vacuumed
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn version_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        let columns = self.schema.columns();
        if row.len() != columns.len() {
            return Err(DbError::ExecutionError(format!(
                "Expected {} columns, got {}",
                columns.len(),
                row.len()
            )));
        }
        for (column, value) in columns.iter().zip(row.iter()) {
            column.validate(value)?;
        }
        Ok(())
    }

    fn update_indexes(&mut self, id: usize, row: &Row) {
        for (col_name, index) in &mut self.indexes {
            if let Some(col_idx) = self.schema.find_column_index(col_name) {
                index.entry(row[col_idx].clone()).or_default().insert(id);
            }
        }
    }

    /// Remove versions no snapshot can see any more.
    ///
    /// `horizon` is the oldest running transaction; superseded versions whose deleter
    /// committed before it are dropped along with everything written by aborted
    /// transactions. Returns the number of purged versions.
    pub fn vacuum(&mut self, horizon: &Snapshot, aborted: &HashSet<u64>) -> usize {
        let mut purged = 0;

        for versions in self.rows.values_mut() {
            let before = versions.len();
            versions.retain(|v| {
                if aborted.contains(&v.xmin) {
                    return false;
                }
                match v.xmax {
                    Some(xmax) => !(horizon.is_committed(xmax) && xmax < horizon.tx_id),
                    None => true,
                }
            });
            for version in versions.iter_mut() {
                if version.xmax.is_some_and(|x| aborted.contains(&x)) {
                    version.xmax = None;
                }
            }
            purged += before - versions.len();
        }

        self.rows.retain(|_, versions| !versions.is_empty());

        if purged > 0 {
            for index in self.indexes.values_mut() {
                index.clear();
            }
            let live: Vec<(usize, Row)> = self
                .rows
                .iter()
                .flat_map(|(id, versions)| versions.iter().map(move |v| (*id, v.row.clone())))
                .collect();
            for (id, row) in live {
                self.update_indexes(id, &row);
            }
        }

        purged
    }
}
