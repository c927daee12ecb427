//! Steps - atomic, invertible, mappable document mutations

use crate::{Assoc, DocModelError, Document, Mapping, Mark, Node, Result, StepMap};
use serde::{Deserialize, Serialize};

/// One atomic document mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum Step {
    /// Replace the nodes in `from..to` with `slice`
    Replace {
        from: usize,
        to: usize,
        slice: Vec<Node>,
    },
    /// Add a mark to every text node in `from..to`
    AddMark { from: usize, to: usize, mark: Mark },
    /// Remove a mark from every text node in `from..to`
    RemoveMark { from: usize, to: usize, mark: Mark },
    /// Set an attribute on the block opener at `pos`; `null` removes it
    SetAttr {
        pos: usize,
        key: String,
        value: serde_json::Value,
    },
}

impl Step {
    pub fn insert(pos: usize, nodes: Vec<Node>) -> Self {
        Step::Replace {
            from: pos,
            to: pos,
            slice: nodes,
        }
    }

    pub fn insert_text(pos: usize, text: &str) -> Self {
        Self::insert(pos, crate::text_nodes(text))
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Step::Replace {
            from,
            to,
            slice: Vec::new(),
        }
    }

    pub fn add_mark(from: usize, to: usize, mark: Mark) -> Self {
        Step::AddMark { from, to, mark }
    }

    pub fn remove_mark(from: usize, to: usize, mark: Mark) -> Self {
        Step::RemoveMark { from, to, mark }
    }

    pub fn set_attr(pos: usize, key: impl Into<String>, value: serde_json::Value) -> Self {
        Step::SetAttr {
            pos,
            key: key.into(),
            value,
        }
    }

    /// Apply the step, producing the next document.
    ///
    /// The input document is never modified; the result always satisfies
    /// the schema.
    pub fn apply(&self, doc: &Document) -> Result<Document> {
        let mut next = doc.clone();
        match self {
            Step::Replace { from, to, slice } => {
                doc.check_range(*from, *to)?;
                next.nodes_mut().splice(*from..*to, slice.iter().cloned());
            }
            Step::AddMark { from, to, mark } => {
                doc.check_range(*from, *to)?;
                for node in &mut next.nodes_mut()[*from..*to] {
                    if let Node::Text(text) = node {
                        text.marks.add(mark.clone());
                    }
                }
            }
            Step::RemoveMark { from, to, mark } => {
                doc.check_range(*from, *to)?;
                for node in &mut next.nodes_mut()[*from..*to] {
                    if let Node::Text(text) = node {
                        text.marks.remove(mark);
                    }
                }
            }
            Step::SetAttr { pos, key, value } => {
                let size = doc.len();
                match next.nodes_mut().get_mut(*pos) {
                    Some(Node::Block(block)) => {
                        if value.is_null() {
                            block.attrs.remove(key);
                        } else {
                            block.attrs.insert(key.clone(), value.clone());
                        }
                    }
                    Some(Node::Text(_)) => return Err(DocModelError::NotABlock(*pos)),
                    None => return Err(DocModelError::OutOfRange { pos: *pos, size }),
                }
            }
        }
        next.validate()?;
        Ok(next)
    }

    /// Build the step that undoes this one, given the document it applied to
    pub fn invert(&self, prior: &Document) -> Result<Step> {
        match self {
            Step::Replace { from, to, slice } => Ok(Step::Replace {
                from: *from,
                to: from + slice.len(),
                slice: prior.slice(*from, *to)?,
            }),
            Step::AddMark { from, to, mark } => {
                let restore = prior.slice(*from, *to)?;
                let untouched = restore
                    .iter()
                    .filter_map(Node::as_text)
                    .all(|t| t.marks.iter().all(|m| m.kind() != mark.kind()));
                if untouched {
                    Ok(Step::remove_mark(*from, *to, mark.clone()))
                } else {
                    Ok(Step::Replace {
                        from: *from,
                        to: *to,
                        slice: restore,
                    })
                }
            }
            Step::RemoveMark { from, to, mark } => {
                let restore = prior.slice(*from, *to)?;
                let uniform = restore
                    .iter()
                    .filter_map(Node::as_text)
                    .all(|t| t.marks.contains(mark));
                if uniform {
                    Ok(Step::add_mark(*from, *to, mark.clone()))
                } else {
                    Ok(Step::Replace {
                        from: *from,
                        to: *to,
                        slice: restore,
                    })
                }
            }
            Step::SetAttr { pos, key, .. } => {
                let block = match prior.node_at(*pos) {
                    Some(Node::Block(block)) => block,
                    Some(Node::Text(_)) => return Err(DocModelError::NotABlock(*pos)),
                    None => {
                        return Err(DocModelError::OutOfRange {
                            pos: *pos,
                            size: prior.len(),
                        })
                    }
                };
                let old = block
                    .attrs
                    .get(key)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Ok(Step::set_attr(*pos, key.clone(), old))
            }
        }
    }

    /// The position map of this step
    pub fn get_map(&self) -> StepMap {
        match self {
            Step::Replace { from, to, slice } => StepMap::replace(*from, to - from, slice.len()),
            _ => StepMap::identity(),
        }
    }

    /// Re-address the step so it applies after the steps behind `mapping`.
    ///
    /// `assoc` only matters for a pure insertion that meets a concurrent
    /// insertion at the same point. Returns `None` when nothing is left for
    /// the step to do.
    pub fn map(&self, mapping: &Mapping, assoc: Assoc) -> Option<Step> {
        match self {
            Step::Replace { from, to, slice } => {
                let (from_assoc, to_assoc) = if from == to {
                    (assoc, assoc)
                } else {
                    (Assoc::After, Assoc::Before)
                };
                let from_r = mapping.map_result(*from, from_assoc);
                let to_r = mapping.map_result(*to, to_assoc);
                if from_r.deleted_across && to_r.deleted_across {
                    return None;
                }
                let to = to_r.pos.max(from_r.pos);
                if from_r.pos == to && slice.is_empty() {
                    return None;
                }
                Some(Step::Replace {
                    from: from_r.pos,
                    to,
                    slice: slice.clone(),
                })
            }
            Step::AddMark { from, to, mark } => {
                let (from, to) = map_range(mapping, *from, *to)?;
                Some(Step::add_mark(from, to, mark.clone()))
            }
            Step::RemoveMark { from, to, mark } => {
                let (from, to) = map_range(mapping, *from, *to)?;
                Some(Step::remove_mark(from, to, mark.clone()))
            }
            Step::SetAttr { pos, key, value } => {
                let result = mapping.map_result(*pos, Assoc::After);
                if result.deleted_after {
                    return None;
                }
                Some(Step::set_attr(result.pos, key.clone(), value.clone()))
            }
        }
    }
}

fn map_range(mapping: &Mapping, from: usize, to: usize) -> Option<(usize, usize)> {
    let from = mapping.map(from, Assoc::After);
    let to = mapping.map(to, Assoc::Before);
    (from < to).then_some((from, to))
}
