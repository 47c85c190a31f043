use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

use crate::error::{invalid_argument, StoreResult};

/// Slash-separated path to a collection or document.
///
/// Paths with an even number of segments name documents, odd ones name
/// collections. The root path is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn from_string(path: &str) -> StoreResult<Self> {
        if path.contains("//") {
            return Err(invalid_argument(format!(
                "invalid path \"{path}\": path segments must not be empty"
            )));
        }
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self { segments })
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn append(&self, other: &ResourcePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Returns the path without its first `count` segments.
    pub fn pop_first(&self, count: usize) -> Self {
        Self {
            segments: self.segments.iter().skip(count).cloned().collect(),
        }
    }

    /// Returns the path without its final segment.
    pub fn pop_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    /// True when `other` is a document or collection directly below this
    /// path, with exactly one extra segment.
    pub fn is_immediate_parent_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() == self.segments.len() + 1 && self.is_prefix_of(other)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (left, right) in self.segments.iter().zip(other.segments.iter()) {
            match left.cmp(right) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}
