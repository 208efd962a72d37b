//! Incremental XML stream parsing: raw bytes in, complete depth-1
//! element trees out.
//!
//! XMPP frames stanzas inside one long-lived `<stream:stream>`
//! document, so the parser cannot wait for a complete document. It
//! buffers bytes, reports the stream header as soon as its opening tag
//! is complete, and emits every depth-1 element once its subtree
//! closes. A buffer ending mid-stanza is normal during TCP streaming;
//! the partial tail stays buffered until the next feed.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::ns;
use crate::tag::Tag;

/// A complete node extracted from the inbound byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// The `<stream:stream …>` header. Emitted once per stream open;
    /// the element stays open for the stream's lifetime.
    StreamOpen(Tag),
    /// A complete depth-1 element (stanza or negotiation element).
    Stanza(Tag),
    /// `</stream:stream>`.
    StreamClose,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParserError {
    #[error("malformed XML at byte {0}")]
    Malformed(usize),
    #[error("text content outside any stanza")]
    StrayText,
    #[error("mismatched closing tag </{0}>")]
    MismatchedEnd(String),
    #[error("stanza exceeds {0} buffered bytes")]
    Overflow(usize),
}

/// Upper bound for a single buffered stanza. Typical stanzas are a few
/// KB; the largest legitimate ones (vCard avatars, MAM result pages)
/// rarely exceed 100 KB. Input that never completes a stanza within
/// this limit is treated as a protocol violation rather than allowed
/// to grow the buffer without bound.
const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Buffering stream parser. `reset()` discards all state; the engine
/// calls it on every stream re-open (after STARTTLS, compression and
/// SASL).
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> StreamParser {
        StreamParser::default()
    }

    /// Drop buffered bytes; the next feed starts a fresh document.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently buffered awaiting completion.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes and extract every node that is now complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Node>, ParserError> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
            return Err(ParserError::Overflow(MAX_STANZA_BUFFER_SIZE));
        }

        let mut nodes = Vec::new();
        loop {
            match read_node(&self.buffer)? {
                Some((node, consumed)) => {
                    self.buffer.drain(..consumed);
                    nodes.push(node);
                }
                None => break,
            }
        }
        Ok(nodes)
    }
}

/// Strip a `stream:` prefix, mirroring how the prefix resolves against
/// the stream root's `xmlns:stream` declaration. Returns the local
/// name and whether the prefix was present.
fn strip_stream_prefix(qname: &str) -> (String, bool) {
    match qname.strip_prefix("stream:") {
        Some(local) => (local.to_string(), true),
        None => (qname.to_string(), false),
    }
}

/// Build a `Tag` from a start (or empty) event. `stream:`-prefixed
/// elements get an explicit `xmlns` so downstream matching never sees
/// a prefix.
fn tag_from_event(e: &BytesStart<'_>, pos: usize) -> Result<Tag, ParserError> {
    let qname = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let (local, prefixed) = strip_stream_prefix(&qname);
    let mut tag = Tag::new(&local);
    if prefixed {
        tag.set_attribute("xmlns", ns::STREAM);
    }
    for attr in e.attributes() {
        let attr = attr.map_err(|_| ParserError::Malformed(pos))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if prefixed && key == "xmlns" {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|_| ParserError::Malformed(pos))?;
        tag.set_attribute(&key, &value);
    }
    Ok(tag)
}

fn is_stream_root(e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == b"stream:stream" || e.name().as_ref() == b"stream"
}

/// Extract one complete node from the front of `buffer`, returning the
/// node and the number of bytes it consumed, or `None` when the buffer
/// holds no complete node yet.
fn read_node(buffer: &[u8]) -> Result<Option<(Node, usize)>, ParserError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    // Elements whose subtree is still open, root of the stanza first.
    let mut stack: Vec<Tag> = Vec::new();

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                // Stream-level metadata before the header; nothing to keep.
                continue;
            }
            Ok(Event::Start(e)) => {
                if stack.is_empty() && is_stream_root(&e) {
                    let mut tag = tag_from_event(&e, pos)?;
                    // The root resolves its own prefix.
                    tag.set_attribute("xmlns", ns::STREAM);
                    let consumed = reader.buffer_position() as usize;
                    return Ok(Some((Node::StreamOpen(tag), consumed)));
                }
                stack.push(tag_from_event(&e, pos)?);
            }
            Ok(Event::Empty(e)) => {
                let tag = tag_from_event(&e, pos)?;
                if stack.is_empty() {
                    let consumed = reader.buffer_position() as usize;
                    return Ok(Some((Node::Stanza(tag), consumed)));
                }
                let parent = stack.last_mut().unwrap();
                parent.add_child(tag);
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|_| ParserError::Malformed(pos))?;
                match stack.last_mut() {
                    Some(parent) => parent.append_cdata(&text),
                    // Whitespace between stanzas is a keepalive; real
                    // text at stream level is not legal XMPP.
                    None if text.trim().is_empty() => {
                        let consumed = reader.buffer_position() as usize;
                        if consumed == buffer.len() {
                            return Ok(None);
                        }
                        continue;
                    }
                    None => return Err(ParserError::StrayText),
                }
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                match stack.last_mut() {
                    Some(parent) => parent.append_cdata(&text),
                    None => return Err(ParserError::StrayText),
                }
            }
            Ok(Event::End(e)) => {
                let qname = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let (local, _) = strip_stream_prefix(&qname);
                match stack.pop() {
                    Some(done) => {
                        if done.name() != local {
                            return Err(ParserError::MismatchedEnd(local));
                        }
                        if stack.is_empty() {
                            let consumed = reader.buffer_position() as usize;
                            return Ok(Some((Node::Stanza(done), consumed)));
                        }
                        stack.last_mut().unwrap().add_child(done);
                    }
                    None if local == "stream" => {
                        let consumed = reader.buffer_position() as usize;
                        return Ok(Some((Node::StreamClose, consumed)));
                    }
                    None => return Err(ParserError::MismatchedEnd(local)),
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // Expected during TCP streaming: the buffer ends inside a
            // tag that the next read will complete.
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return Ok(None),
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(_) => return Err(ParserError::Malformed(pos)),
        }
    }
}

/// Parse one complete standalone element. Used by tests and by callers
/// that hold a full stanza in hand.
pub fn parse_tag(xml: &str) -> Result<Tag, ParserError> {
    match read_node(xml.as_bytes())? {
        Some((Node::Stanza(tag), _)) => Ok(tag),
        Some((Node::StreamOpen(tag), _)) => Ok(tag),
        _ => Err(ParserError::Malformed(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_open_reports_header() {
        let mut parser = StreamParser::new();
        let nodes = parser
            .feed(b"<?xml version='1.0'?><stream:stream id='s1' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.org'>")
            .unwrap();
        assert_eq!(nodes.len(), 1);
        match &nodes[0] {
            Node::StreamOpen(tag) => {
                assert_eq!(tag.name(), "stream");
                assert_eq!(tag.attribute("id"), Some("s1"));
                assert_eq!(tag.attribute("version"), Some("1.0"));
                assert_eq!(tag.xmlns(), Some(ns::STREAM));
            }
            other => panic!("expected StreamOpen, got {:?}", other),
        }
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_features_after_header_in_one_read() {
        let mut parser = StreamParser::new();
        let nodes = parser
            .feed(b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' version='1.0'><stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>")
            .unwrap();
        assert_eq!(nodes.len(), 2);
        match &nodes[1] {
            Node::Stanza(tag) => {
                assert_eq!(tag.name(), "features");
                assert_eq!(tag.xmlns(), Some(ns::STREAM));
                assert!(tag.find_child_ns("starttls", ns::TLS).is_some());
            }
            other => panic!("expected features stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_stanza_stays_buffered() {
        let mut parser = StreamParser::new();
        let nodes = parser.feed(b"<iq type='get' id='q1'><query xmlns='jabber:iq:r").unwrap();
        assert!(nodes.is_empty());
        assert!(parser.pending() > 0);

        let nodes = parser.feed(b"oster'/></iq>").unwrap();
        assert_eq!(nodes.len(), 1);
        match &nodes[0] {
            Node::Stanza(tag) => {
                assert_eq!(tag.name(), "iq");
                assert_eq!(tag.find_child("query").and_then(|q| q.xmlns()), Some("jabber:iq:roster"));
            }
            other => panic!("expected iq, got {:?}", other),
        }
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_multiple_stanzas_one_feed() {
        let mut parser = StreamParser::new();
        let nodes = parser
            .feed(b"<presence from='a@b'/><message to='c@d'><body>Hello</body></message><r xmlns='urn:xmpp:sm:3'/>")
            .unwrap();
        assert_eq!(nodes.len(), 3);
        match &nodes[1] {
            Node::Stanza(tag) => assert_eq!(tag.find_child("body").map(|b| b.cdata()), Some("Hello")),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_close() {
        let mut parser = StreamParser::new();
        let nodes = parser.feed(b"</stream:stream>").unwrap();
        assert_eq!(nodes, vec![Node::StreamClose]);
    }

    #[test]
    fn test_whitespace_keepalive_between_stanzas() {
        let mut parser = StreamParser::new();
        let nodes = parser.feed(b" \n <presence/>").unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_escaped_content_round_trips() {
        let mut parser = StreamParser::new();
        let nodes = parser
            .feed(b"<message to='o&apos;brien@example.org'><body>1 &lt; 2 &amp; more</body></message>")
            .unwrap();
        match &nodes[0] {
            Node::Stanza(tag) => {
                assert_eq!(tag.attribute("to"), Some("o'brien@example.org"));
                assert_eq!(tag.find_child("body").map(|b| b.cdata()), Some("1 < 2 & more"));
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_end_is_an_error() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"<iq type='get'><query></iq>").is_err());
    }

    #[test]
    fn test_reset_discards_partial_input() {
        let mut parser = StreamParser::new();
        parser.feed(b"<iq type='get'><que").unwrap();
        assert!(parser.pending() > 0);
        parser.reset();
        assert_eq!(parser.pending(), 0);
        let nodes = parser.feed(b"<presence/>").unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_nested_same_name_children() {
        let mut parser = StreamParser::new();
        let nodes = parser
            .feed(b"<message><x><x>deep</x></x></message>")
            .unwrap();
        assert_eq!(nodes.len(), 1);
        match &nodes[0] {
            Node::Stanza(tag) => {
                let outer = tag.find_child("x").unwrap();
                assert_eq!(outer.find_child("x").map(|i| i.cdata()), Some("deep"));
            }
            other => panic!("expected message, got {:?}", other),
        }
    }
}
