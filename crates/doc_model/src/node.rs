//! Position units of the content tree
//!
//! A document is stored as a flat run of nodes: a block opener followed by
//! the characters of that block. Every node is exactly one position wide,
//! which keeps position arithmetic for steps and mappings trivial.

use crate::MarkSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Block types known to the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading,
    Blockquote,
    CodeBlock,
    ListItem,
}

impl BlockKind {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "p",
            BlockKind::Heading => "h",
            BlockKind::Blockquote => "blockquote",
            BlockKind::CodeBlock => "pre",
            BlockKind::ListItem => "li",
        }
    }

    /// Whether text inside this block may carry marks
    pub fn allows_marks(&self) -> bool {
        !matches!(self, BlockKind::CodeBlock)
    }
}

/// Attribute map of a block opener
pub type Attrs = BTreeMap<String, serde_json::Value>;

/// Opens a new block; all following text nodes belong to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNode {
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: Attrs,
}

impl BlockNode {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            attrs: Attrs::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// A single character with its marks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextNode {
    pub ch: char,
    #[serde(default, skip_serializing_if = "MarkSet::is_empty")]
    pub marks: MarkSet,
}

/// One position unit of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Block(BlockNode),
    Text(TextNode),
}

impl Node {
    /// A plain, unmarked character
    pub fn text(ch: char) -> Self {
        Node::Text(TextNode {
            ch,
            marks: MarkSet::new(),
        })
    }

    pub fn marked(ch: char, marks: MarkSet) -> Self {
        Node::Text(TextNode { ch, marks })
    }

    pub fn block(kind: BlockKind) -> Self {
        Node::Block(BlockNode::new(kind))
    }

    pub fn paragraph() -> Self {
        Self::block(BlockKind::Paragraph)
    }

    pub fn heading(level: u8) -> Self {
        Node::Block(BlockNode::new(BlockKind::Heading).with_attr("level", level.into()))
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Node::Block(_))
    }

    pub fn as_block(&self) -> Option<&BlockNode> {
        match self {
            Node::Block(block) => Some(block),
            Node::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextNode> {
        match self {
            Node::Text(text) => Some(text),
            Node::Block(_) => None,
        }
    }
}

/// Convert a string into unmarked text nodes
pub fn text_nodes(text: &str) -> Vec<Node> {
    text.chars().map(Node::text).collect()
}
