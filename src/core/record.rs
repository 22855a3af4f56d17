//! Versioned, named documents with a tombstone and a whole-record merge rule.
//!
//! A record carries four reserved fields (`Name`, `Modified`, `Deleted`, `Note`) and an open map
//! of extra properties. `Modified` is both the logical version and the physical timestamp; the
//! merge rule in [`Record::merge`] is newest-wins over the whole record, not per field.

use crate::core::error::CairnError;
use crate::core::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Deletes are stamped this far in the past so a same-instant edit elsewhere wins.
pub const DELETE_BACKDATE_MS: i64 = 100;

pub const RESERVED_FIELDS: &[&str] = &["Name", "Modified", "Deleted", "Note"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Modified", with = "time::iso", default = "time::now")]
    modified: DateTime<Utc>,
    #[serde(rename = "Deleted", default, deserialize_with = "null_as_false")]
    deleted: bool,
    #[serde(rename = "Note", default, deserialize_with = "null_as_empty")]
    note: String,
    #[serde(flatten)]
    properties: Map<String, JsonValue>,
    /// Memory diverges from the last known persisted copy.
    #[serde(skip)]
    dirty: bool,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

impl Record {
    /// New dirty record stamped now.
    pub fn new(name: impl Into<String>) -> Self {
        let mut record = Self::with_timestamp(name, time::now());
        record.invalidate(true);
        record
    }

    /// Clean record with an explicit version, as if read from disk.
    pub fn with_timestamp(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified: time::truncate_to_tick(modified),
            deleted: false,
            note: String::new(),
            properties: Map::new(),
            dirty: false,
        }
    }

    /// New dirty record carrying the fields of `document`.
    pub fn with_properties(
        name: impl Into<String>,
        document: &JsonValue,
    ) -> Result<Self, CairnError> {
        let mut record = Self::new(name);
        record.set_property(document)?;
        Ok(record)
    }

    /// Parse one stored document; a missing `Modified` is stamped now.
    pub fn from_document(document: JsonValue) -> Result<Self, CairnError> {
        if !document.is_object() {
            return Err(CairnError::FormatError(format!(
                "record must be a JSON object, got {}",
                document
            )));
        }
        Ok(serde_json::from_value(document)?)
    }

    pub fn to_document(&self) -> Result<JsonValue, CairnError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn modified_ticks(&self) -> i64 {
        time::to_ticks(&self.modified)
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn properties(&self) -> &Map<String, JsonValue> {
        &self.properties
    }

    pub fn get(&self, property: &str) -> Option<&JsonValue> {
        self.properties.get(property)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Shallow merge of `document` onto this record. Clears the tombstone and re-stamps.
    ///
    /// `Note` is taken from the document when it is a string; the other reserved fields are
    /// owned by the record and ignored.
    pub fn set_property(&mut self, document: &JsonValue) -> Result<(), CairnError> {
        let fields = document.as_object().ok_or_else(|| {
            CairnError::ValidationError(format!(
                "set_property on '{}' expects a JSON object, got {}",
                self.name, document
            ))
        })?;
        self.deleted = false;
        self.invalidate(false);
        for (key, value) in fields {
            if key == "Note" {
                if let Some(note) = value.as_str() {
                    self.note = note.to_string();
                }
            } else if RESERVED_FIELDS.contains(&key.as_str()) {
                tracing::debug!(record = %self.name, field = %key, "ignoring reserved field");
            } else {
                self.properties.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Remove one open property. Returns whether it was present.
    pub fn delete_property(&mut self, property: &str) -> bool {
        self.deleted = false;
        self.invalidate(false);
        self.properties.remove(property).is_some()
    }

    /// Tombstone the record. Returns false, touching nothing, when already deleted.
    pub fn delete(&mut self, by: Option<&str>, back_date: bool) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        if back_date {
            self.modified = time::add_ticks(
                &time::now(),
                -DELETE_BACKDATE_MS * time::TICKS_PER_MILLISECOND,
            );
        }
        self.invalidate(back_date);
        let mut line = format!("[{}] deleted", time::format_note_stamp(&self.modified));
        if let Some(by) = by.filter(|b| !b.is_empty()) {
            line.push_str(" by ");
            line.push_str(by);
        }
        self.note = format!("{};\n{}", line, self.note);
        true
    }

    /// Mark memory as diverging from disk; re-stamp unless `preserve_timestamp`.
    pub fn invalidate(&mut self, preserve_timestamp: bool) {
        self.dirty = true;
        if !preserve_timestamp {
            self.modified = time::now();
        }
    }

    /// Memory now matches the persisted copy.
    pub fn validate(&mut self) {
        self.dirty = false;
    }

    /// Move `Modified` just past `floor` when it does not already lie after it.
    pub(crate) fn ensure_newer_than(&mut self, floor: &DateTime<Utc>) {
        if time::to_ticks(&self.modified) <= time::to_ticks(floor) {
            self.modified = time::add_ticks(floor, 1);
        }
    }

    /// Whether the record's JSON text contains every term of `filter`.
    ///
    /// Terms are separated by spaces or `+`. An empty filter matches everything.
    pub fn matches(&self, filter: &str) -> bool {
        let Ok(text) = serde_json::to_string(self) else {
            return false;
        };
        filter
            .split(['+', ' '])
            .filter(|term| !term.is_empty())
            .all(|term| text.contains(term))
    }

    /// Everything except `Modified`, serialized deterministically.
    fn content_fingerprint(&self) -> String {
        serde_json::to_string(&(&self.name, self.deleted, &self.note, &self.properties))
            .unwrap_or_default()
    }

    pub fn same_content(&self, other: &Record) -> bool {
        self.content_fingerprint() == other.content_fingerprint()
    }

    /// Dedup equality: same name, versions within `sharpness` ticks, same content.
    pub fn equals(&self, other: &Record, sharpness: i64) -> bool {
        self.name == other.name
            && (self.modified_ticks() - other.modified_ticks()).abs() <= sharpness
            && self.same_content(other)
    }

    /// Newest-wins merge of `second` into this record.
    pub fn merge(&mut self, second: &Record) -> Result<(), CairnError> {
        if self.name != second.name {
            return Err(CairnError::NameMismatch {
                left: self.name.clone(),
                right: second.name.clone(),
            });
        }
        let mine = self.modified_ticks();
        let theirs = second.modified_ticks();
        if mine == theirs {
            if !self.same_content(second) {
                tracing::warn!(
                    record = %self.name,
                    modified = %time::format_iso(&self.modified),
                    "equal versions with diverging content; keeping local copy"
                );
            }
            self.dirty = false;
            return Ok(());
        }
        if theirs > mine {
            self.adopt(second);
        }
        self.dirty = true;
        Ok(())
    }

    fn adopt(&mut self, second: &Record) {
        self.modified = second.modified;
        self.deleted = second.deleted;
        self.note = second.note.clone();
        self.properties = second.properties.clone();
    }
}
