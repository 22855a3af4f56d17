//! Nested-array encoding shared by canonical files and change files.
//!
//! The outer array holds one inner array per key; each inner array is that key's history,
//! oldest first.

use crate::core::error::CairnError;
use crate::core::record::Record;
use serde_json::Value as JsonValue;

/// How far into the text the legacy-format sniffing looks.
const SNIFF_LIMIT: usize = 100;

/// Reject the legacy flat encoding before paying for a full parse.
fn sniff(text: &str) -> Result<(), CairnError> {
    let mut brackets = 0;
    for c in text.chars().take(SNIFF_LIMIT) {
        match c {
            '[' => {
                brackets += 1;
                if brackets >= 2 {
                    return Ok(());
                }
            }
            '{' => {
                return Err(CairnError::FormatError(
                    "top-level object found; expected an array of record arrays".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

pub fn decode(text: &str) -> Result<Vec<Vec<Record>>, CairnError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    sniff(text)?;
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|e| CairnError::FormatError(format!("unreadable record file: {}", e)))?;
    let outer = match value {
        JsonValue::Array(outer) => outer,
        other => {
            return Err(CairnError::FormatError(format!(
                "expected an array of record arrays, found {}",
                type_name(&other)
            )));
        }
    };
    let mut stacks = Vec::with_capacity(outer.len());
    for inner in outer {
        let inner = match inner {
            JsonValue::Array(inner) => inner,
            other => {
                return Err(CairnError::FormatError(format!(
                    "expected a record array, found {}",
                    type_name(&other)
                )));
            }
        };
        let records = inner
            .into_iter()
            .map(Record::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        if !records.is_empty() {
            stacks.push(records);
        }
    }
    Ok(stacks)
}

pub fn encode<'a, I, S>(stacks: I, pretty: bool) -> Result<String, CairnError>
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = &'a Record>,
{
    let nested: Vec<Vec<&Record>> = stacks
        .into_iter()
        .map(|s| s.into_iter().collect())
        .collect();
    let text = if pretty {
        serde_json::to_string_pretty(&nested)?
    } else {
        serde_json::to_string(&nested)?
    };
    Ok(text)
}

fn type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
