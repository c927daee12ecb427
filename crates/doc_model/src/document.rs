//! Document content and schema validation

use crate::{BlockKind, BlockNode, DocModelError, Mark, Node, Result, TextNode};
use serde::{Deserialize, Serialize};

/// The full content of one rich-text field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    nodes: Vec<Node>,
}

/// Tree view of one block and its text
#[derive(Debug, Clone, PartialEq)]
pub struct BlockView<'a> {
    /// Position of the block opener
    pub pos: usize,
    pub block: &'a BlockNode,
    pub text: &'a [Node],
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    /// A document holding one empty paragraph
    pub fn empty() -> Self {
        Self {
            nodes: vec![Node::paragraph()],
        }
    }

    /// Build a document from nodes, validating it against the schema
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self> {
        let doc = Self { nodes };
        doc.validate()?;
        Ok(doc)
    }

    /// One plain paragraph per input string
    pub fn from_paragraphs<'a>(paragraphs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut nodes = Vec::new();
        for text in paragraphs {
            nodes.push(Node::paragraph());
            nodes.extend(text.chars().map(Node::text));
        }
        if nodes.is_empty() {
            return Self::empty();
        }
        Self { nodes }
    }

    /// Number of positions spanned (a valid position is in `0..=len`)
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A schema-valid document always holds at least one block
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_at(&self, pos: usize) -> Option<&Node> {
        self.nodes.get(pos)
    }

    /// Copy out the nodes between two positions
    pub fn slice(&self, from: usize, to: usize) -> Result<Vec<Node>> {
        self.check_range(from, to)?;
        Ok(self.nodes[from..to].to_vec())
    }

    pub(crate) fn check_range(&self, from: usize, to: usize) -> Result<()> {
        let size = self.nodes.len();
        if from > size {
            return Err(DocModelError::OutOfRange { pos: from, size });
        }
        if to > size || to < from {
            return Err(DocModelError::OutOfRange { pos: to, size });
        }
        Ok(())
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.nodes
    }

    /// Check the content against the schema
    pub fn validate(&self) -> Result<()> {
        let mut current: Option<&BlockNode> = None;
        for (pos, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Block(block) => {
                    validate_block(pos, block)?;
                    current = Some(block);
                }
                Node::Text(text) => {
                    let Some(block) = current else {
                        return Err(DocModelError::SchemaViolation(format!(
                            "text at {pos} is outside any block"
                        )));
                    };
                    validate_text(pos, block, text)?;
                }
            }
        }
        if current.is_none() {
            return Err(DocModelError::SchemaViolation(
                "document must contain at least one block".to_string(),
            ));
        }
        Ok(())
    }

    /// Group text nodes under their block openers
    pub fn blocks(&self) -> Vec<BlockView<'_>> {
        let mut views = Vec::new();
        let mut pos = 0;
        while pos < self.nodes.len() {
            let Node::Block(block) = &self.nodes[pos] else {
                pos += 1;
                continue;
            };
            let start = pos + 1;
            let end = self.nodes[start..]
                .iter()
                .position(Node::is_block)
                .map_or(self.nodes.len(), |offset| start + offset);
            views.push(BlockView {
                pos,
                block,
                text: &self.nodes[start..end],
            });
            pos = end;
        }
        views
    }

    /// Plain text with blocks separated by newlines
    pub fn text_content(&self) -> String {
        self.blocks()
            .iter()
            .map(|view| {
                view.text
                    .iter()
                    .filter_map(Node::as_text)
                    .map(|t| t.ch)
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Find the block containing a position, if any
    pub fn block_at(&self, pos: usize) -> Option<&BlockNode> {
        if self.nodes.is_empty() {
            return None;
        }
        let end = pos.min(self.nodes.len() - 1);
        self.nodes[..=end].iter().rev().find_map(Node::as_block)
    }
}

fn validate_block(pos: usize, block: &BlockNode) -> Result<()> {
    if block.kind == BlockKind::Heading {
        let level = block.attrs.get("level").and_then(|v| v.as_u64());
        if !matches!(level, Some(1..=6)) {
            return Err(DocModelError::SchemaViolation(format!(
                "heading at {pos} needs a level between 1 and 6"
            )));
        }
    }
    Ok(())
}

fn validate_text(pos: usize, block: &BlockNode, text: &TextNode) -> Result<()> {
    if !block.kind.allows_marks() && !text.marks.is_empty() {
        return Err(DocModelError::SchemaViolation(format!(
            "marks are not allowed inside {:?} (at {pos})",
            block.kind
        )));
    }
    for mark in text.marks.iter() {
        if let Mark::Link { href } = mark {
            if href.trim().is_empty() {
                return Err(DocModelError::SchemaViolation(format!(
                    "link at {pos} has an empty href"
                )));
            }
        }
    }
    Ok(())
}
