use std::collections::BTreeMap;

use crate::error::{invalid_argument, StoreResult};
use crate::model::mutation::FieldMask;
use crate::model::FieldPath;
use crate::value::Value;

/// Structured document contents: a tree of named fields.
///
/// Field access and updates address nested maps through [`FieldPath`]s.
/// Setting a field below a non-map value replaces that value with a map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds contents from a JSON object; other JSON kinds are rejected.
    pub fn from_json(json: serde_json::Value) -> StoreResult<Self> {
        match Value::from_json(json) {
            Value::Map(fields) => Ok(Self { fields }),
            other => Err(invalid_argument(format!(
                "document contents must be a JSON object, got {other:?}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let mut current = &self.fields;
        for (index, segment) in path.iter().enumerate() {
            let value = current.get(segment)?;
            if index + 1 == path.len() {
                return Some(value);
            }
            match value {
                Value::Map(nested) => current = nested,
                _ => return None,
            }
        }
        None
    }

    pub fn set(&mut self, path: &FieldPath, value: Value) {
        set_in(&mut self.fields, path, value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_in(&mut self.fields, path);
    }

    /// The mask of leaf field paths present in these contents. An empty
    /// nested map counts as a leaf.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, None, &mut paths);
        FieldMask::new(paths)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Map(self.fields)
    }
}

fn set_in(fields: &mut BTreeMap<String, Value>, path: &[String], value: Value) {
    if path.len() == 1 {
        fields.insert(path[0].clone(), value);
        return;
    }
    let entry = fields
        .entry(path[0].clone())
        .or_insert_with(|| Value::Map(BTreeMap::new()));
    if !entry.is_map() {
        *entry = Value::Map(BTreeMap::new());
    }
    if let Value::Map(nested) = entry {
        set_in(nested, &path[1..], value);
    }
}

fn delete_in(fields: &mut BTreeMap<String, Value>, path: &[String]) {
    if path.len() == 1 {
        fields.remove(&path[0]);
        return;
    }
    if let Some(Value::Map(nested)) = fields.get_mut(&path[0]) {
        delete_in(nested, &path[1..]);
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, Value>,
    prefix: Option<&FieldPath>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        let current = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            // Segments from stored maps are never empty, so this cannot fail.
            None => match FieldPath::new(vec![key.clone()]) {
                Ok(path) => path,
                Err(_) => continue,
            },
        };
        match value {
            Value::Map(nested) if !nested.is_empty() => {
                collect_leaf_paths(nested, Some(&current), out)
            }
            _ => out.push(current),
        }
    }
}
