//! Queries and their normalized target form.

mod filter;
mod target;

pub use filter::{FieldFilter, Operator};
pub use target::{Bound, Direction, OrderBy, Target};

use std::cmp::Ordering;
use std::sync::Arc;

use crate::model::document_set::DocumentComparator;
use crate::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::util::hard_assert;

/// Whether a limit counts from the start or the end of the result order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

/// A user-facing query: path, constraints and an explicit sort order.
///
/// The full sort order, an inequality field and the trailing key ordering
/// included, is derived on demand; [`Query::to_target`] produces the
/// normalized form the backend and the caches work with.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<i32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// A query over a single collection or a single document path.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// A query over every collection with the given id.
    pub fn collection_group(group: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(group.into());
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn with_added_filter(mut self, filter: FieldFilter) -> Self {
        hard_assert(
            !self.is_document_query(),
            "no filters are allowed on document queries",
        );
        self.filters.push(filter);
        self
    }

    pub fn with_added_order_by(mut self, order_by: OrderBy) -> Self {
        hard_assert(
            !self.is_document_query(),
            "no ordering is allowed on document queries",
        );
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Whether every document under the query path matches, in which case
    /// cached query results never miss documents.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    fn inequality_filter_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.is_inequality())
            .map(|filter| &filter.field)
    }

    /// The complete sort order: explicit components, an implicit ordering
    /// on the inequality field when no explicit one is given, and a
    /// trailing key ordering in the direction of the last component.
    pub fn order_by(&self) -> Vec<OrderBy> {
        let inequality_field = self.inequality_filter_field();
        let first_order_by_field = self.explicit_order_by.first().map(|o| &o.field);
        if let (Some(inequality_field), None) = (inequality_field, first_order_by_field) {
            return if inequality_field.is_key_field() {
                vec![OrderBy::key_ordering(Direction::Ascending)]
            } else {
                vec![
                    OrderBy::ascending(inequality_field.clone()),
                    OrderBy::key_ordering(Direction::Ascending),
                ]
            };
        }
        hard_assert(
            inequality_field.is_none() || inequality_field == first_order_by_field,
            "an inequality filter must order by its field first",
        );
        let mut order_by = self.explicit_order_by.clone();
        if !order_by.iter().any(|o| o.field.is_key_field()) {
            let direction = order_by
                .last()
                .map(|o| o.direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::key_ordering(direction));
        }
        order_by
    }

    /// Total order over matching documents; the trailing key component
    /// breaks all ties.
    pub fn comparator(&self) -> Arc<DocumentComparator> {
        let order_by = self.order_by();
        Arc::new(move |left: &Document, right: &Document| {
            let mut compared_on_key = false;
            for ordering in &order_by {
                let result = ordering.compare(left, right);
                if result != Ordering::Equal {
                    return result;
                }
                compared_on_key = compared_on_key || ordering.field.is_key_field();
            }
            hard_assert(compared_on_key, "query order must include the document key");
            Ordering::Equal
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path_and_collection_group(doc)
            && self.matches_order_by(doc)
            && self.matches_filters(doc)
            && self.matches_bounds(doc)
    }

    fn matches_path_and_collection_group(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if DocumentKey::is_document_path(&self.path) {
            self.collection_group.is_none() && &self.path == doc_path
        } else if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    /// Documents must carry every explicitly ordered field; the implicit
    /// components are guaranteed by the filters and the key.
    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|o| o.field.is_key_field() || doc.field(&o.field).is_some())
    }

    fn matches_filters(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if end.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// The normalized target. A limit-to-last query becomes a reversed
    /// limit-to-first target; the view re-reverses the results.
    pub fn to_target(&self) -> Target {
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: self.order_by(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: self
                    .order_by()
                    .into_iter()
                    .map(|o| OrderBy::new(o.field, o.direction.reversed()))
                    .collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), !bound.before)),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position.clone(), !bound.before)),
            },
        }
    }

    /// Identity string for maps of active queries. Two queries with equal
    /// canonical ids share listen state.
    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "|lt:f",
            LimitType::Last => "|lt:l",
        };
        format!("{}{}", self.to_target().canonical_id(), suffix)
    }
}
