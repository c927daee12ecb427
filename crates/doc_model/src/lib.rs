//! Document Model - rich-text content, steps and versioned state
//!
//! This crate provides the content model edited collaboratively: a
//! schema-checked document, the steps that mutate it, the position maps
//! used to rebase steps over each other, and a versioned document state.

mod document;
mod error;
mod html;
mod mark;
mod node;
mod selection;
mod state;
mod step;
mod step_map;

pub use document::*;
pub use error::*;
pub use mark::*;
pub use node::*;
pub use selection::*;
pub use state::*;
pub use step::*;
pub use step_map::*;
