//! Owned XML element trees, the unit of stanza routing.
//!
//! A `Tag` keeps its attributes and children in insertion order so a
//! serialized stanza reproduces the order it was built (or parsed) in.

use std::fmt;

/// Escape the five XML-significant characters.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// An XML element: name, ordered attributes, ordered children and
/// character data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tag {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Tag>,
    cdata: String,
}

impl Tag {
    pub fn new(name: &str) -> Tag {
        Tag {
            name: name.to_string(),
            ..Tag::default()
        }
    }

    /// Shorthand for the common `<name xmlns='…'/>` shape of
    /// negotiation stanzas.
    pub fn with_xmlns(name: &str, xmlns: &str) -> Tag {
        let mut tag = Tag::new(name);
        tag.set_attribute("xmlns", xmlns);
        tag
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The element's `xmlns` attribute, if declared on the element
    /// itself.
    pub fn xmlns(&self) -> Option<&str> {
        self.attribute("xmlns")
    }

    pub fn set_xmlns(&mut self, xmlns: &str) {
        self.set_attribute("xmlns", xmlns);
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attribute(&self, key: &str, value: &str) -> bool {
        self.attribute(key) == Some(value)
    }

    /// Set or replace an attribute, keeping first-set order.
    pub fn set_attribute(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.attributes.push((key.to_string(), value.to_string()));
        }
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn add_child(&mut self, child: Tag) -> &mut Tag {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    pub fn children(&self) -> &[Tag] {
        &self.children
    }

    pub fn find_child(&self, name: &str) -> Option<&Tag> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn find_child_ns(&self, name: &str, xmlns: &str) -> Option<&Tag> {
        self.children
            .iter()
            .find(|c| c.name == name && c.xmlns() == Some(xmlns))
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.find_child(name).is_some()
    }

    pub fn cdata(&self) -> &str {
        &self.cdata
    }

    pub fn set_cdata(&mut self, cdata: &str) {
        self.cdata = cdata.to_string();
    }

    pub fn append_cdata(&mut self, cdata: &str) {
        self.cdata.push_str(cdata);
    }

    /// Serialize to wire XML. Character data precedes child elements;
    /// an element with neither self-closes.
    pub fn xml(&self) -> String {
        let mut out = String::new();
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v));
            out.push('\'');
        }
        if self.cdata.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return out;
        }
        out.push('>');
        out.push_str(&escape(&self.cdata));
        for child in &self.children {
            out.push_str(&child.xml());
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
        out
    }
}

/// Display delegates to the wire serialization; handy in log fields.
impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_closing_when_empty() {
        let tag = Tag::with_xmlns("starttls", "urn:ietf:params:xml:ns:xmpp-tls");
        assert_eq!(tag.xml(), "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    }

    #[test]
    fn test_cdata_and_children_serialize_in_order() {
        let mut iq = Tag::new("iq");
        iq.set_attribute("type", "set");
        iq.set_attribute("id", "b1");
        let mut bind = Tag::with_xmlns("bind", "urn:ietf:params:xml:ns:xmpp-bind");
        let mut res = Tag::new("resource");
        res.set_cdata("balcony");
        bind.add_child(res);
        iq.add_child(bind);
        assert_eq!(
            iq.xml(),
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>balcony</resource></bind></iq>"
        );
    }

    #[test]
    fn test_escaping() {
        let mut body = Tag::new("body");
        body.set_cdata("1 < 2 & \"so\" 'on'");
        assert_eq!(body.xml(), "<body>1 &lt; 2 &amp; &quot;so&quot; &apos;on&apos;</body>");

        let mut m = Tag::new("message");
        m.set_attribute("to", "o'brien@example.org");
        assert_eq!(m.xml(), "<message to='o&apos;brien@example.org'/>");
    }

    #[test]
    fn test_attribute_replacement_keeps_position() {
        let mut tag = Tag::new("presence");
        tag.set_attribute("to", "a@b");
        tag.set_attribute("type", "probe");
        tag.set_attribute("to", "c@d");
        assert_eq!(tag.xml(), "<presence to='c@d' type='probe'/>");
    }

    #[test]
    fn test_find_child_by_namespace() {
        let mut features = Tag::new("features");
        features.add_child(Tag::with_xmlns("bind", "urn:ietf:params:xml:ns:xmpp-bind"));
        features.add_child(Tag::with_xmlns("session", "urn:ietf:params:xml:ns:xmpp-session"));
        assert!(features.find_child_ns("bind", "urn:ietf:params:xml:ns:xmpp-bind").is_some());
        assert!(features.find_child_ns("bind", "urn:other").is_none());
    }
}
