//! Replicated document store
//!
//! One [`DocumentStore`] holds the tables and values of a single user on a
//! single replica. Local writes are stamped by the store's
//! [`HybridClock`]; remote [`Changes`] are folded in with per-field
//! last-writer-wins. Row deletion leaves a tombstone stamp so a stale write
//! arriving later can never bring the row back.
//!
//! Mutations are synchronous and immediately visible to reads. Listeners run
//! synchronously after each committed mutation, while the caller still holds
//! the store; they must not call back into the same store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::changes::{Change, Changes, Digest, Stamped};
use crate::clock::{HybridClock, Stamp};
use crate::error::StoreError;
use crate::schema::{CellValue, Row, Schema, TableDef};

/// A store shared between tasks (server connections, persisters, transport)
pub type SharedStore = Arc<Mutex<DocumentStore>>;

/// Wrap a store for sharing
pub fn shared(store: DocumentStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store. A listener that panicked does not leave the data
/// half-written, so a poisoned lock is still usable.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, DocumentStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a batch of changes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// A mutation made through this store's API
    Local,
    /// Merged from a sync peer
    Remote,
    /// Merged from a specific server-side connection
    Connection(u64),
    /// Loaded from durable storage
    Storage,
}

/// Notification delivered to listeners
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent<'a> {
    pub source: ChangeSource,
    pub changes: &'a Changes,
}

/// Handle returned by [`DocumentStore::add_listener`]
pub type ListenerId = u64;

type Listener = Box<dyn FnMut(&ChangeEvent<'_>) + Send>;

/// Which side of the sync link a store lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Client,
    /// Refuses client-only values such as the passphrase
    Server,
}

/// Merge state of one row.
///
/// A row is visible only while every column of its table holds a cell; a
/// write that lands after a delete but covers just some columns (a
/// concurrent progress update, say) is kept for convergence but does not
/// bring the row back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct RowState {
    /// Only cells newer than `deleted` are kept
    cells: BTreeMap<String, Stamped<CellValue>>,
    deleted: Option<Stamp>,
}

impl RowState {
    fn is_live(&self, def: &TableDef) -> bool {
        def.columns.iter().all(|c| self.cells.contains_key(&c.name))
    }

    fn hides(&self, stamp: &Stamp) -> bool {
        self.deleted.as_ref().is_some_and(|d| stamp <= d)
    }

    fn prune(&mut self) {
        if let Some(deleted) = &self.deleted {
            self.cells.retain(|_, cell| cell.stamp > *deleted);
        }
    }

    fn visible(&self) -> Row {
        self.cells
            .iter()
            .map(|(column, cell)| (column.clone(), cell.value.clone()))
            .collect()
    }

    fn hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(&Sha256::digest(bytes)[..8])
    }

    fn to_changes(&self, table: &str, row: &str, out: &mut Changes) {
        if let Some(stamp) = &self.deleted {
            out.push(Change::RowDelete {
                table: table.to_string(),
                row: row.to_string(),
                stamp: stamp.clone(),
            });
        }
        if !self.cells.is_empty() {
            out.push(Change::RowSet {
                table: table.to_string(),
                row: row.to_string(),
                cells: self.cells.clone(),
            });
        }
    }
}

/// In-memory, mergeable tables and values of one user
pub struct DocumentStore {
    schema: Arc<Schema>,
    role: StoreRole,
    clock: HybridClock,
    tables: BTreeMap<String, BTreeMap<String, RowState>>,
    values: BTreeMap<String, Stamped<Option<CellValue>>>,
    listeners: BTreeMap<ListenerId, Listener>,
    next_listener: ListenerId,
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("replica", &self.clock.replica())
            .field("role", &self.role)
            .field("tables", &self.tables.len())
            .field("values", &self.values.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl DocumentStore {
    /// Create an empty client store
    pub fn new(schema: Arc<Schema>, replica: impl Into<String>) -> Self {
        Self {
            schema,
            role: StoreRole::Client,
            clock: HybridClock::new(replica),
            tables: BTreeMap::new(),
            values: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_listener: 0,
        }
    }

    /// Create an empty store with the todo schema
    pub fn todo(replica: impl Into<String>) -> Self {
        Self::new(Arc::new(Schema::todo()), replica)
    }

    pub fn with_role(mut self, role: StoreRole) -> Self {
        self.role = role;
        self
    }

    pub fn replica(&self) -> &str {
        self.clock.replica()
    }

    pub fn role(&self) -> StoreRole {
        self.role
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    // ==================== Rows ====================

    /// Replace a row. Columns not given take their schema default.
    pub fn set_row(&mut self, table: &str, row_id: &str, fields: Row) -> Result<(), StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.table(table)?;
        if row_id.is_empty() {
            return Err(StoreError::MissingRowId(table.to_string()));
        }

        let mut full = def.default_row();
        for (column, value) in &fields {
            full.insert(column.clone(), def.check_cell(column, value)?);
        }

        let changes = self.write_cells(table, row_id, full);
        self.emit(ChangeSource::Local, &changes);
        Ok(())
    }

    /// Update some cells of a row, creating it with defaults if absent
    pub fn set_partial_row(
        &mut self,
        table: &str,
        row_id: &str,
        fields: Row,
    ) -> Result<(), StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.table(table)?;
        if row_id.is_empty() {
            return Err(StoreError::MissingRowId(table.to_string()));
        }

        let mut cells = if self.has_row(table, row_id) {
            Row::new()
        } else {
            def.default_row()
        };
        for (column, value) in &fields {
            cells.insert(column.clone(), def.check_cell(column, value)?);
        }
        if cells.is_empty() {
            return Ok(());
        }

        let changes = self.write_cells(table, row_id, cells);
        self.emit(ChangeSource::Local, &changes);
        Ok(())
    }

    /// Set a single cell
    pub fn set_cell(
        &mut self,
        table: &str,
        row_id: &str,
        column: &str,
        value: impl Into<CellValue>,
    ) -> Result<(), StoreError> {
        let mut fields = Row::new();
        fields.insert(column.to_string(), value.into());
        self.set_partial_row(table, row_id, fields)
    }

    fn write_cells(&mut self, table: &str, row_id: &str, cells: Row) -> Changes {
        let stamp = self.clock.tick();
        let row = self
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default();

        let mut written = BTreeMap::new();
        for (column, value) in cells {
            let cell = Stamped::new(value, stamp.clone());
            row.cells.insert(column.clone(), cell.clone());
            written.insert(column, cell);
        }

        Changes::from(vec![Change::RowSet {
            table: table.to_string(),
            row: row_id.to_string(),
            cells: written,
        }])
    }

    fn row_state(&self, table: &str, row_id: &str) -> Option<&RowState> {
        self.tables.get(table).and_then(|rows| rows.get(row_id))
    }

    fn live_row(&self, table: &str, row_id: &str) -> Option<&RowState> {
        let def = self.schema.table(table).ok()?;
        self.row_state(table, row_id).filter(|row| row.is_live(def))
    }

    /// Live rows of a table, in id order
    fn live_rows<'a>(&'a self, table: &str) -> impl Iterator<Item = (&'a String, &'a RowState)> {
        let def = self.schema.table(table).ok();
        self.tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(move |(_, row)| def.is_some_and(|def| row.is_live(def)))
    }

    pub fn get_row(&self, table: &str, row_id: &str) -> Option<Row> {
        self.live_row(table, row_id).map(RowState::visible)
    }

    pub fn get_cell(&self, table: &str, row_id: &str, column: &str) -> Option<CellValue> {
        self.live_row(table, row_id)
            .and_then(|row| row.cells.get(column))
            .map(|cell| cell.value.clone())
    }

    pub fn has_row(&self, table: &str, row_id: &str) -> bool {
        self.live_row(table, row_id).is_some()
    }

    /// Ids of the live rows of a table, in id order
    pub fn get_row_ids(&self, table: &str) -> Vec<String> {
        self.live_rows(table).map(|(id, _)| id.clone()).collect()
    }

    /// All live rows of a table
    pub fn get_table(&self, table: &str) -> BTreeMap<String, Row> {
        self.live_rows(table)
            .map(|(id, row)| (id.clone(), row.visible()))
            .collect()
    }

    /// Delete a row. Returns `false` if there was no live row.
    pub fn del_row(&mut self, table: &str, row_id: &str) -> Result<bool, StoreError> {
        self.schema.table(table)?;
        if !self.has_row(table, row_id) {
            return Ok(false);
        }

        let mut changes = Changes::new();
        self.tombstone_row(table, row_id, &mut changes);
        self.emit(ChangeSource::Local, &changes);
        Ok(true)
    }

    fn tombstone_row(&mut self, table: &str, row_id: &str, out: &mut Changes) {
        let stamp = self.clock.tick();
        if let Some(row) = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(row_id))
        {
            row.deleted = Some(stamp.clone());
            row.prune();
            out.push(Change::RowDelete {
                table: table.to_string(),
                row: row_id.to_string(),
                stamp,
            });
        }
    }

    /// Delete every row of every table
    pub fn del_tables(&mut self) {
        let live: Vec<(String, String)> = self
            .tables
            .keys()
            .flat_map(|table| {
                self.live_rows(table)
                    .map(move |(id, _)| (table.clone(), id.clone()))
            })
            .collect();

        let mut changes = Changes::new();
        for (table, row_id) in live {
            self.tombstone_row(&table, &row_id, &mut changes);
        }
        if !changes.is_empty() {
            self.emit(ChangeSource::Local, &changes);
        }
    }

    // ==================== Values ====================

    pub fn set_value(&mut self, name: &str, value: impl Into<CellValue>) -> Result<(), StoreError> {
        let value = self.schema.check_value(name, &value.into())?;
        if self.role == StoreRole::Server && self.schema.value(name)?.client_only {
            return Err(StoreError::ClientOnlyValue(name.to_string()));
        }

        let stamp = self.clock.tick();
        self.values.insert(
            name.to_string(),
            Stamped::new(Some(value.clone()), stamp.clone()),
        );
        let changes = Changes::from(vec![Change::ValueSet {
            id: name.to_string(),
            value,
            stamp,
        }]);
        self.emit(ChangeSource::Local, &changes);
        Ok(())
    }

    pub fn get_value(&self, name: &str) -> Option<CellValue> {
        self.values.get(name).and_then(|v| v.value.clone())
    }

    /// All set values
    pub fn get_values(&self) -> BTreeMap<String, CellValue> {
        self.values
            .iter()
            .filter_map(|(name, v)| v.value.clone().map(|value| (name.clone(), value)))
            .collect()
    }

    /// Delete a value. Returns `false` if it was not set.
    pub fn del_value(&mut self, name: &str) -> Result<bool, StoreError> {
        self.schema.value(name)?;
        if self.get_value(name).is_none() {
            return Ok(false);
        }

        let mut changes = Changes::new();
        self.tombstone_value(name, &mut changes);
        self.emit(ChangeSource::Local, &changes);
        Ok(true)
    }

    fn tombstone_value(&mut self, name: &str, out: &mut Changes) {
        let stamp = self.clock.tick();
        self.values
            .insert(name.to_string(), Stamped::new(None, stamp.clone()));
        out.push(Change::ValueDelete {
            id: name.to_string(),
            stamp,
        });
    }

    /// Delete every value
    pub fn del_values(&mut self) {
        let live: Vec<String> = self.get_values().into_keys().collect();
        let mut changes = Changes::new();
        for name in live {
            self.tombstone_value(&name, &mut changes);
        }
        if !changes.is_empty() {
            self.emit(ChangeSource::Local, &changes);
        }
    }

    /// Drop all content without recording deletions. Used when a client
    /// switches users; nothing is emitted, so nothing propagates.
    pub fn clear(&mut self) {
        self.tables.clear();
        self.values.clear();
    }

    // ==================== Merge ====================

    /// Apply remote changes; returns the subset that changed this replica
    pub fn merge_with(&mut self, remote: &Changes) -> Changes {
        self.merge_from(remote, ChangeSource::Remote)
    }

    /// Like [`merge_with`](Self::merge_with), tagging listeners with `source`
    pub fn merge_from(&mut self, remote: &Changes, source: ChangeSource) -> Changes {
        let mut effective = Changes::new();
        for change in remote {
            if let Some(applied) = self.apply_remote(change) {
                effective.push(applied);
            }
        }
        if !effective.is_empty() {
            self.emit(source, &effective);
        }
        effective
    }

    fn apply_remote(&mut self, change: &Change) -> Option<Change> {
        match change {
            Change::RowSet { table, row, cells } => self.apply_row_set(table, row, cells),
            Change::RowDelete { table, row, stamp } => self.apply_row_delete(table, row, stamp),
            Change::ValueSet { id, value, stamp } => {
                self.apply_value(id, Some(value), stamp)
            }
            Change::ValueDelete { id, stamp } => self.apply_value(id, None, stamp),
        }
    }

    fn apply_row_set(
        &mut self,
        table: &str,
        row_id: &str,
        cells: &BTreeMap<String, Stamped<CellValue>>,
    ) -> Option<Change> {
        let schema = Arc::clone(&self.schema);
        let def = match schema.table(table) {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!("Dropping remote row {}: {}", row_id, e);
                return None;
            }
        };
        if row_id.is_empty() {
            return None;
        }

        let mut accepted = BTreeMap::new();
        for (column, cell) in cells {
            let value = match def.check_cell(column, &cell.value) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Dropping remote cell: {}", e);
                    continue;
                }
            };
            self.clock.observe(&cell.stamp);

            let current = self.row_state(table, row_id);
            let stale = current.is_some_and(|row| {
                row.hides(&cell.stamp)
                    || row
                        .cells
                        .get(column)
                        .is_some_and(|existing| existing.stamp >= cell.stamp)
            });
            if !stale {
                accepted.insert(column.clone(), Stamped::new(value, cell.stamp.clone()));
            }
        }
        if accepted.is_empty() {
            return None;
        }

        let row = self
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default();
        row.cells
            .extend(accepted.iter().map(|(k, v)| (k.clone(), v.clone())));

        Some(Change::RowSet {
            table: table.to_string(),
            row: row_id.to_string(),
            cells: accepted,
        })
    }

    fn apply_row_delete(&mut self, table: &str, row_id: &str, stamp: &Stamp) -> Option<Change> {
        if let Err(e) = self.schema.table(table) {
            tracing::warn!("Dropping remote delete of {}: {}", row_id, e);
            return None;
        }
        if row_id.is_empty() {
            return None;
        }
        self.clock.observe(stamp);

        let row = self
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default();
        if row.hides(stamp) {
            return None;
        }
        row.deleted = Some(stamp.clone());
        row.prune();

        Some(Change::RowDelete {
            table: table.to_string(),
            row: row_id.to_string(),
            stamp: stamp.clone(),
        })
    }

    fn apply_value(
        &mut self,
        name: &str,
        value: Option<&CellValue>,
        stamp: &Stamp,
    ) -> Option<Change> {
        let def = match self.schema.value(name) {
            Ok(def) => def,
            Err(e) => {
                tracing::warn!("Dropping remote value: {}", e);
                return None;
            }
        };
        if def.client_only && self.role == StoreRole::Server {
            tracing::warn!("Dropping client-only value {} sent to server", name);
            return None;
        }
        let value = match value.map(|v| self.schema.check_value(name, v)).transpose() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Dropping remote value: {}", e);
                return None;
            }
        };
        self.clock.observe(stamp);

        if self
            .values
            .get(name)
            .is_some_and(|existing| existing.stamp >= *stamp)
        {
            return None;
        }
        self.values
            .insert(name.to_string(), Stamped::new(value.clone(), stamp.clone()));

        Some(match value {
            Some(value) => Change::ValueSet {
                id: name.to_string(),
                value,
                stamp: stamp.clone(),
            },
            None => Change::ValueDelete {
                id: name.to_string(),
                stamp: stamp.clone(),
            },
        })
    }

    // ==================== Anti-entropy ====================

    /// Full merge state, tombstones included
    pub fn snapshot(&self) -> Changes {
        let mut out = Changes::new();
        for (table, rows) in &self.tables {
            for (row_id, row) in rows {
                row.to_changes(table, row_id, &mut out);
            }
        }
        for (name, value) in &self.values {
            out.push(match &value.value {
                Some(v) => Change::ValueSet {
                    id: name.clone(),
                    value: v.clone(),
                    stamp: value.stamp.clone(),
                },
                None => Change::ValueDelete {
                    id: name.clone(),
                    stamp: value.stamp.clone(),
                },
            });
        }
        out
    }

    /// Summary of this replica's merge state
    pub fn digest(&self) -> Digest {
        Digest {
            tables: self
                .tables
                .iter()
                .map(|(table, rows)| {
                    let hashes = rows.iter().map(|(id, row)| (id.clone(), row.hash())).collect();
                    (table.clone(), hashes)
                })
                .collect(),
            values: self
                .values
                .iter()
                .map(|(name, v)| (name.clone(), v.stamp.clone()))
                .collect(),
        }
    }

    /// Changes a peer with the given digest does not have yet
    pub fn changes_missing_from(&self, peer: &Digest) -> Changes {
        let mut out = Changes::new();
        for (table, rows) in &self.tables {
            let peer_rows = peer.tables.get(table);
            for (row_id, row) in rows {
                let peer_hash = peer_rows.and_then(|r| r.get(row_id));
                if peer_hash != Some(&row.hash()) {
                    row.to_changes(table, row_id, &mut out);
                }
            }
        }
        for (name, value) in &self.values {
            if peer.values.get(name).map_or(true, |theirs| *theirs < value.stamp) {
                out.push(match &value.value {
                    Some(v) => Change::ValueSet {
                        id: name.clone(),
                        value: v.clone(),
                        stamp: value.stamp.clone(),
                    },
                    None => Change::ValueDelete {
                        id: name.clone(),
                        stamp: value.stamp.clone(),
                    },
                });
            }
        }
        out
    }

    /// Drop changes to client-only values; those never leave the device
    pub fn shareable(&self, mut changes: Changes) -> Changes {
        changes.retain(|change| match change {
            Change::ValueSet { id, .. } | Change::ValueDelete { id, .. } => !self
                .schema
                .value(id)
                .is_ok_and(|def| def.client_only),
            _ => true,
        });
        changes
    }

    /// Whether two replicas hold the same merge state
    pub fn same_state(&self, other: &DocumentStore) -> bool {
        self.tables == other.tables && self.values == other.values
    }

    // ==================== Listeners ====================

    /// Register a callback run after every committed mutation
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeEvent<'_>) + Send + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.insert(id, Box::new(listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn emit(&mut self, source: ChangeSource, changes: &Changes) {
        let event = ChangeEvent { source, changes };
        for listener in self.listeners.values_mut() {
            listener(&event);
        }
    }
}
