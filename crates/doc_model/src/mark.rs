//! Inline marks (bold, italic, links, ...)

use serde::{Deserialize, Serialize};

/// Discriminant of a mark, used for exclusivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
    Link,
}

/// A mark applied to a run of text
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
    Link { href: String },
}

impl Mark {
    /// Create a link mark
    pub fn link(href: impl Into<String>) -> Self {
        Mark::Link { href: href.into() }
    }

    pub fn kind(&self) -> MarkKind {
        match self {
            Mark::Bold => MarkKind::Bold,
            Mark::Italic => MarkKind::Italic,
            Mark::Underline => MarkKind::Underline,
            Mark::Strike => MarkKind::Strike,
            Mark::Code => MarkKind::Code,
            Mark::Link { .. } => MarkKind::Link,
        }
    }

    /// HTML tag used when rendering the mark
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Mark::Bold => "strong",
            Mark::Italic => "em",
            Mark::Underline => "u",
            Mark::Strike => "s",
            Mark::Code => "code",
            Mark::Link { .. } => "a",
        }
    }
}

/// An ordered set of marks holding at most one mark per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkSet(Vec<Mark>);

impl MarkSet {
    /// Create an empty mark set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a set from marks; later marks of the same kind win
    pub fn from_marks(marks: impl IntoIterator<Item = Mark>) -> Self {
        let mut set = Self::new();
        for mark in marks {
            set.add(mark);
        }
        set
    }

    /// Add a mark, replacing any existing mark of the same kind.
    /// Returns true if the set changed.
    pub fn add(&mut self, mark: Mark) -> bool {
        if self.0.contains(&mark) {
            return false;
        }
        self.0.retain(|m| m.kind() != mark.kind());
        let idx = self.0.partition_point(|m| m < &mark);
        self.0.insert(idx, mark);
        true
    }

    /// Remove a mark. Returns true if it was present.
    pub fn remove(&mut self, mark: &Mark) -> bool {
        let before = self.0.len();
        self.0.retain(|m| m != mark);
        self.0.len() != before
    }

    pub fn contains(&self, mark: &Mark) -> bool {
        self.0.contains(mark)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mark> {
        self.0.iter()
    }
}
