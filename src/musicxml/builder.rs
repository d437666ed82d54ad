//! Low-level MusicXML string building
//!
//! A push_str buffer with indentation helpers, the document skeleton, and
//! the fixed child order of an `<attributes>` block. Attribute children are
//! sorted by [`AttrKind`], an ordered enum, before serialization.

use std::fmt::Write as _;

/// Children of `<attributes>` in their mandatory document order.
/// The derived `Ord` follows declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttrKind {
    Divisions,
    Key,
    Time,
    Staves,
    Clef,
    StaffDetails,
    Transpose,
}

/// One pending attribute child: its kind plus the rendered XML fragment
#[derive(Clone, Debug)]
pub struct AttrChild {
    pub kind: AttrKind,
    pub xml: String,
}

/// Indentation-aware XML buffer
pub struct XmlBuilder {
    buffer: String,
    depth: usize,
}

impl XmlBuilder {
    pub fn new() -> Self {
        XmlBuilder { buffer: String::new(), depth: 0 }
    }

    pub fn with_depth(depth: usize) -> Self {
        XmlBuilder { buffer: String::new(), depth }
    }

    pub fn open(&mut self, tag: &str) {
        self.line(&format!("<{}>", tag));
        self.depth += 1;
    }

    pub fn open_attrs(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        let mut t = String::from(tag);
        for (k, v) in attrs {
            let _ = write!(t, " {}=\"{}\"", k, xml_escape(v));
        }
        self.line(&format!("<{}>", t));
        self.depth += 1;
    }

    pub fn close(&mut self, tag: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(&format!("</{}>", tag));
    }

    /// `<tag>text</tag>` on one line
    pub fn leaf(&mut self, tag: &str, text: &str) {
        self.line(&format!("<{}>{}</{}>", tag, xml_escape(text), tag));
    }

    /// Self-closing element, optionally with attributes
    pub fn empty(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        let mut t = String::from(tag);
        for (k, v) in attrs {
            let _ = write!(t, " {}=\"{}\"", k, xml_escape(v));
        }
        self.line(&format!("<{}/>", t));
    }

    pub fn leaf_attrs(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) {
        let mut t = String::from(tag);
        for (k, v) in attrs {
            let _ = write!(t, " {}=\"{}\"", k, xml_escape(v));
        }
        self.line(&format!("<{}>{}</{}>", t, xml_escape(text), tag));
    }

    /// Append a pre-rendered fragment, re-indenting each line
    pub fn raw(&mut self, fragment: &str) {
        for l in fragment.lines() {
            self.line(l);
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.buffer.push_str("  ");
        }
        self.buffer.push_str(text);
        self.buffer.push('\n');
    }

    /// Emit an `<attributes>` block with its children in canonical order.
    /// The sort is stable so multiple clefs keep their staff order.
    pub fn attributes(&mut self, mut children: Vec<AttrChild>) {
        if children.is_empty() {
            return;
        }
        children.sort_by_key(|c| c.kind);
        self.open("attributes");
        for child in children {
            self.raw(&child.xml);
        }
        self.close("attributes");
    }

    pub fn finish(self) -> String {
        self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for XmlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap rendered parts and a part-list into the score-partwise skeleton
pub fn document(
    title: Option<&str>,
    composer: Option<&str>,
    part_list: &str,
    parts: &str,
) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<!DOCTYPE score-partwise PUBLIC \"-//Recordare//DTD MusicXML 3.1 Partwise//EN\" \"http://www.musicxml.org/dtds/partwise.dtd\">\n");
    xml.push_str("<score-partwise version=\"3.1\">\n");
    if let Some(t) = title {
        if !t.is_empty() {
            xml.push_str("  <movement-title>");
            xml.push_str(&xml_escape(t));
            xml.push_str("</movement-title>\n");
        }
    }
    if let Some(c) = composer {
        if !c.is_empty() {
            xml.push_str("  <identification>\n    <creator type=\"composer\">");
            xml.push_str(&xml_escape(c));
            xml.push_str("</creator>\n  </identification>\n");
        }
    }
    xml.push_str(part_list);
    xml.push_str(parts);
    xml.push_str("</score-partwise>\n");
    xml
}

/// Escape special XML characters
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
