//! Owned XML element tree for stanzas and stream-level elements.

use std::fmt;

use quick_xml::escape::escape;

use crate::protocol::{NS_DIALBACK, NS_SERVER, NS_STREAMS};

/// A child node of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// A namespaced XML element.
///
/// `name` is the local name; `prefix` is kept only so that stream-level
/// elements (`stream:features`, `db:result`) serialize the way peers expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    ns: String,
    /// Extra `xmlns:prefix` bindings, for qualified attributes.
    prefixes: Vec<(String, String)>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            prefix: None,
            name: name.into(),
            ns: ns.into(),
            prefixes: Vec::new(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A prefixed element, e.g. `Element::prefixed("db", "result", NS_DIALBACK)`.
    pub fn prefixed(prefix: impl Into<String>, name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self { prefix: Some(prefix.into()), ..Self::new(name, ns) }
    }

    // ── Builders ─────────────────────────────────────────────────────────────

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// True if this element has the given local name and namespace.
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns == ns
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Bind `prefix` on this element so attributes like `prefix:key` stay resolvable.
    pub fn declare_prefix(&mut self, prefix: impl Into<String>, ns: impl Into<String>) {
        let prefix = prefix.into();
        let ns = ns.into();
        match self.prefixes.iter_mut().find(|(p, _)| *p == prefix) {
            Some(slot) => slot.1 = ns,
            None => self.prefixes.push((prefix, ns)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(idx).1)
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn append_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, skipping text nodes.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, ns))
    }

    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.get_child(name, ns).is_some()
    }

    /// Concatenated character data of this element (not of its descendants).
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    // ── Serialization ────────────────────────────────────────────────────────

    /// Serialize as a top-level element of a `jabber:server` stream.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, NS_SERVER);
        out
    }

    fn write_xml(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);

        match &self.prefix {
            None if self.ns != parent_ns => push_attr(out, "xmlns", &self.ns),
            // `stream` and `db` are declared once on the stream header.
            Some(p) if !is_stream_declared(p, &self.ns) => push_attr(out, &format!("xmlns:{p}"), &self.ns),
            _ => {}
        }
        for (p, ns) in &self.prefixes {
            if self.prefix.as_deref() != Some(p.as_str()) && !is_stream_declared(p, ns) {
                push_attr(out, &format!("xmlns:{p}"), ns);
            }
        }
        for (k, v) in &self.attrs {
            push_attr(out, k, v);
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        // Children of a prefixed element inherit the default namespace, not the prefixed one.
        let scope = if self.prefix.is_some() { parent_ns } else { self.ns.as_str() };
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_xml(out, scope),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);
        out.push('>');
    }
}

fn is_stream_declared(prefix: &str, ns: &str) -> bool {
    (prefix == "stream" && ns == NS_STREAMS) || (prefix == "db" && ns == NS_DIALBACK)
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("='");
    out.push_str(&escape(value));
    out.push('\'');
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}
