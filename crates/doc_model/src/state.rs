//! Versioned document state

use crate::{Document, Result, Step};
use serde::{Deserialize, Serialize};

/// A document at a specific version.
///
/// The version advances by exactly one for every applied step. A failed
/// step leaves both the content and the version untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    doc: Document,
    version: u64,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new(Document::empty())
    }
}

impl DocumentState {
    /// Start a fresh history at version 0
    pub fn new(doc: Document) -> Self {
        Self { doc, version: 0 }
    }

    /// Adopt a snapshot handed out by an authority
    pub fn at_version(doc: Document, version: u64) -> Self {
        Self { doc, version }
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply one step
    pub fn apply(&mut self, step: &Step) -> Result<()> {
        self.doc = step.apply(&self.doc)?;
        self.version += 1;
        Ok(())
    }

    /// Apply steps in order, stopping at the first failure
    pub fn apply_all<'a>(&mut self, steps: impl IntoIterator<Item = &'a Step>) -> Result<()> {
        for step in steps {
            self.apply(step)?;
        }
        Ok(())
    }

    pub fn into_doc(self) -> Document {
        self.doc
    }
}
