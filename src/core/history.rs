//! Bounded, time-ordered version stacks, one per key.

use crate::core::record::Record;
use chrono::{DateTime, Utc};

pub const DEFAULT_MAX_COUNT: usize = 5;

#[derive(Debug, Clone)]
pub struct RecordHistory {
    key: String,
    items: Vec<Record>,
    max_count: usize,
    sharpness: i64,
}

impl RecordHistory {
    pub fn new(key: impl Into<String>, max_count: usize, sharpness: i64) -> Self {
        Self {
            key: key.into(),
            items: Vec::new(),
            max_count,
            sharpness,
        }
    }

    /// Build from stored snapshots (oldest first) without marking anything dirty.
    pub fn from_snapshots(
        key: impl Into<String>,
        snapshots: Vec<Record>,
        max_count: usize,
        sharpness: i64,
    ) -> Self {
        let mut history = Self::new(key, max_count, sharpness);
        history.items = snapshots;
        history.normalize();
        history.trim();
        history
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn set_key(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.items.iter()
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.items.iter().any(|r| r.equals(record, self.sharpness))
    }

    /// Insert `item` in version order. Returns false when an equal snapshot is already present.
    ///
    /// An item older than the current top lands below it; the top is then flagged dirty because
    /// the persisted history changes even though the current value does not.
    pub fn push(&mut self, mut item: Record, preserve: bool) -> bool {
        if self.contains(&item) {
            return false;
        }
        item.invalidate(preserve);
        let out_of_order = self
            .items
            .last()
            .is_some_and(|top| top.modified_ticks() > item.modified_ticks());
        if out_of_order {
            let ticks = item.modified_ticks();
            let at = self.items.partition_point(|r| r.modified_ticks() <= ticks);
            self.items.insert(at, item);
            if let Some(top) = self.items.last_mut() {
                top.invalidate(true);
            }
        } else {
            self.items.push(item);
        }
        self.trim();
        true
    }

    /// Newest entry, or with `before` the most recent entry strictly older than it.
    pub fn peek(&self, before: Option<&DateTime<Utc>>) -> Option<&Record> {
        match before {
            None => self.items.last(),
            Some(ts) => self.items.iter().rev().find(|r| r.modified() < *ts),
        }
    }

    /// Union with `other`: every entry is pushed, then the whole stack is re-sorted and deduped.
    pub fn merge(&mut self, other: &RecordHistory) {
        for item in other.iter() {
            self.push(item.clone(), true);
        }
        let before = self.items.len();
        self.normalize();
        if self.items.len() != before {
            if let Some(top) = self.items.last_mut() {
                top.invalidate(true);
            }
        }
        self.trim();
    }

    pub fn is_dirty(&self) -> bool {
        self.items.last().is_some_and(|r| r.is_dirty())
    }

    pub fn validate(&mut self) {
        for item in &mut self.items {
            item.validate();
        }
    }

    /// Stable sort by version, then drop entries equal to an earlier one.
    fn normalize(&mut self) {
        self.items.sort_by_key(|r| r.modified_ticks());
        let mut kept: Vec<Record> = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if !kept.iter().any(|k| k.equals(&item, self.sharpness)) {
                kept.push(item);
            }
        }
        self.items = kept;
    }

    fn trim(&mut self) {
        if self.max_count > 0 && self.items.len() > self.max_count {
            let excess = self.items.len() - self.max_count;
            self.items.drain(..excess);
        }
    }
}

impl<'a> IntoIterator for &'a RecordHistory {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
