//! Merge operations exchanged between replicas
//!
//! A [`Changes`] set is an ordered list of typed operations, each carrying
//! its own [`Stamp`]. Applying a set is commutative, associative and
//! idempotent, so the same set can be delivered any number of times, in any
//! order relative to other sets, and replicas still converge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;
use crate::schema::CellValue;

/// A value together with the stamp of the write that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T> Stamped<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }
}

/// One merge operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    /// Set some cells of a row
    RowSet {
        table: String,
        row: String,
        cells: BTreeMap<String, Stamped<CellValue>>,
    },
    /// Tombstone a row; hides every cell written at or before `stamp`
    RowDelete {
        table: String,
        row: String,
        stamp: Stamp,
    },
    /// Set a top-level value
    ValueSet {
        id: String,
        value: CellValue,
        stamp: Stamp,
    },
    /// Tombstone a top-level value
    ValueDelete { id: String, stamp: Stamp },
}

impl Change {
    /// Highest stamp carried by this operation
    pub fn max_stamp(&self) -> Option<&Stamp> {
        match self {
            Change::RowSet { cells, .. } => cells.values().map(|c| &c.stamp).max(),
            Change::RowDelete { stamp, .. }
            | Change::ValueSet { stamp, .. }
            | Change::ValueDelete { stamp, .. } => Some(stamp),
        }
    }
}

/// An ordered set of merge operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Changes(Vec<Change>);

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.0.push(change);
    }

    pub fn extend(&mut self, other: Changes) {
        self.0.extend(other.0);
    }

    pub fn retain(&mut self, f: impl FnMut(&Change) -> bool) {
        self.0.retain(f);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<Change> {
        self.0
    }
}

impl From<Vec<Change>> for Changes {
    fn from(changes: Vec<Change>) -> Self {
        Self(changes)
    }
}

impl IntoIterator for Changes {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Changes {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Summary of a replica's merge state used for anti-entropy.
///
/// Rows are summarised by a short hash over their cells and tombstone;
/// values by their stamp. A peer answers a digest with only the rows whose
/// hash differs and the values it holds a newer stamp for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub tables: BTreeMap<String, BTreeMap<String, String>>,
    pub values: BTreeMap<String, Stamp>,
}

impl Digest {
    pub fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_wire_shape() {
        let change = Change::ValueSet {
            id: "lastSync".into(),
            value: CellValue::Number(12.0),
            stamp: Stamp::new(1, 0, "r1"),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["op"], "value_set");
        assert_eq!(json["value"], 12.0);
        assert_eq!(json["stamp"]["replica"], "r1");
    }

    #[test]
    fn test_rejects_untyped_payloads() {
        let bad = r#"[{"op":"drop_everything","table":"tasks"}]"#;
        assert!(serde_json::from_str::<Changes>(bad).is_err());
    }

    #[test]
    fn test_max_stamp_of_row_set() {
        let mut cells = BTreeMap::new();
        cells.insert("a".to_string(), Stamped::new(CellValue::Bool(true), Stamp::new(3, 0, "x")));
        cells.insert("b".to_string(), Stamped::new(CellValue::Bool(true), Stamp::new(9, 1, "x")));
        let change = Change::RowSet {
            table: "tasks".into(),
            row: "t1".into(),
            cells,
        };
        assert_eq!(change.max_stamp(), Some(&Stamp::new(9, 1, "x")));
    }
}
