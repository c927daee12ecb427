//! HTML serialization used when a field is saved

use crate::{BlockKind, Document, Mark, MarkSet, Node};

impl Document {
    /// Render the document as HTML
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for view in self.blocks() {
            let tag = match view.block.kind {
                BlockKind::Heading => {
                    let level = view
                        .block
                        .attrs
                        .get("level")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(1);
                    format!("h{level}")
                }
                kind => kind.tag().to_string(),
            };
            out.push('<');
            out.push_str(&tag);
            out.push('>');
            render_runs(view.text, &mut out);
            out.push_str("</");
            out.push_str(&tag);
            out.push('>');
        }
        out
    }
}

fn render_runs(text: &[Node], out: &mut String) {
    let mut run = String::new();
    let mut run_marks: Option<&MarkSet> = None;
    for node in text.iter().filter_map(Node::as_text) {
        if run_marks.is_some_and(|marks| marks != &node.marks) {
            flush_run(&run, run_marks, out);
            run.clear();
        }
        run_marks = Some(&node.marks);
        push_escaped(&mut run, node.ch);
    }
    flush_run(&run, run_marks, out);
}

fn flush_run(run: &str, marks: Option<&MarkSet>, out: &mut String) {
    if run.is_empty() {
        return;
    }
    let marks: Vec<&Mark> = marks.map(|m| m.iter().collect()).unwrap_or_default();
    for mark in &marks {
        match mark {
            Mark::Link { href } => {
                out.push_str("<a href=\"");
                for ch in href.chars() {
                    push_escaped(out, ch);
                }
                out.push_str("\">");
            }
            other => {
                out.push('<');
                out.push_str(other.tag());
                out.push('>');
            }
        }
    }
    out.push_str(run);
    for mark in marks.iter().rev() {
        out.push_str("</");
        out.push_str(mark.tag());
        out.push('>');
    }
}

fn push_escaped(out: &mut String, ch: char) {
    match ch {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\'' => out.push_str("&#39;"),
        c => out.push(c),
    }
}
