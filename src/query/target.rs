use std::cmp::Ordering;
use std::fmt;
use std::fmt::Write as _;

use crate::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::query::FieldFilter;
use crate::util::{fail, hard_assert};
use crate::value::{self, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn reversed(&self) -> Direction {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ascending => f.write_str("asc"),
            Direction::Descending => f.write_str("desc"),
        }
    }
}

/// One component of a query's sort order.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn key_ordering(direction: Direction) -> Self {
        Self::new(FieldPath::key_field(), direction)
    }

    /// Compares two documents on this component. Both documents must carry
    /// the ordered field; queries only match such documents.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let result = if self.field.is_key_field() {
            Document::compare_by_key(left, right)
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(left_value), Some(right_value)) => {
                    value::compare(left_value, right_value)
                }
                _ => fail("cannot compare documents missing the ordered field"),
            }
        };
        match self.direction {
            Direction::Ascending => result,
            Direction::Descending => result.reverse(),
        }
    }

    fn canonical_string(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction)
    }
}

/// A cursor position within a query's sort order.
///
/// `before = true` places the bound just before any document at the
/// position, `before = false` just after.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<Value>,
    pub before: bool,
}

impl Bound {
    pub fn new(position: Vec<Value>, before: bool) -> Self {
        Self { position, before }
    }

    /// Whether the bound sorts before the document under the given order.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        hard_assert(
            self.position.len() <= order_by.len(),
            "a bound has at most one position component per ordering component",
        );
        let mut comparison = Ordering::Equal;
        for (component, ordering) in self.position.iter().zip(order_by) {
            if ordering.field.is_key_field() {
                comparison = match component {
                    Value::Reference(key) => key.cmp(doc.key()),
                    _ => fail("key ordering bounds hold reference values"),
                };
            } else {
                match doc.field(&ordering.field) {
                    Some(doc_value) => comparison = value::compare(component, doc_value),
                    None => fail("bound comparison requires the ordered field on the document"),
                }
            }
            if ordering.direction == Direction::Descending {
                comparison = comparison.reverse();
            }
            if comparison != Ordering::Equal {
                break;
            }
        }
        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    fn canonical_string(&self) -> String {
        let mut out = String::from(if self.before { "b:" } else { "a:" });
        for (index, component) in self.position.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&value::canonical_string(component));
        }
        out
    }
}

/// The normalized form of a query, as the watch channel and the target
/// cache see it. Two queries with the same target are served by one
/// backend listen.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<FieldFilter>,
    pub limit: Option<i32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// A target that listens to a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// A stable string identifying the target, used as the key of the
    /// target cache.
    pub fn canonical_id(&self) -> String {
        let mut out = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            out.push_str("|cg:");
            out.push_str(group);
        }
        out.push_str("|f:");
        for (index, filter) in self.filters.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&filter.canonical_string());
        }
        out.push_str("|ob:");
        for (index, ordering) in self.order_by.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&ordering.canonical_string());
        }
        if let Some(limit) = self.limit {
            let _ = write!(out, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            out.push_str("|lb:");
            out.push_str(&bound.canonical_string());
        }
        if let Some(bound) = &self.end_at {
            out.push_str("|ub:");
            out.push_str(&bound.canonical_string());
        }
        out
    }
}
