//! Incremental stream decoder on top of `quick-xml`.
//!
//! Bytes arrive in arbitrary chunks. The decoder buffers them and yields one
//! [`InboundEvent`] per complete top-level item: the stream header, a
//! stanza/negotiation element, or the closing `</stream:stream>`.

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::protocol::{NS_SERVER, StreamHeader};
use crate::xml::Element;

/// Largest top-level element accepted before the stream is refused.
pub const MAX_STANZA_SIZE: usize = 1024 * 1024;

/// One parsed item of an XMPP stream.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StreamOpened(StreamHeader),
    Element(Element),
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed XML: {0}")]
    Malformed(String),
    #[error("expected <stream:stream>, got <{0}>")]
    NotAStream(String),
    #[error("element exceeds {MAX_STANZA_SIZE} bytes")]
    TooLarge,
}

type Scope = HashMap<String, String>;

#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    /// Prefix bindings declared on the stream header; `""` is the default namespace.
    root: Scope,
    header_seen: bool,
    framer: Framer,
    /// End offset of a framed item not yet handed to the parser.
    ready: Option<usize>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Forget everything: a new stream header is expected next.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.root.clear();
        self.header_seen = false;
        self.framer = Framer::default();
        self.ready = None;
    }

    /// Pop the next complete event, or `Ok(None)` if more bytes are needed.
    ///
    /// After the header, bytes are scanned once by the framer; quick-xml only
    /// ever sees a complete top-level item.
    pub fn next_event(&mut self) -> Result<Option<InboundEvent>, DecodeError> {
        loop {
            if !self.header_seen {
                match self.parse_header()? {
                    Step::Incomplete if self.buf.len() > MAX_STANZA_SIZE => return Err(DecodeError::TooLarge),
                    Step::Incomplete => return Ok(None),
                    Step::Skip(consumed) => self.consume(consumed),
                    Step::Event(event, consumed) => {
                        self.consume(consumed);
                        return Ok(Some(event));
                    }
                }
                continue;
            }

            let end = match self.ready {
                Some(end) => end,
                None => match self.framer.scan(&self.buf)? {
                    Some(Frame::Item(end)) => {
                        self.ready = Some(end);
                        end
                    }
                    // Restarted in place, as after SASL success.
                    Some(Frame::Header) => {
                        self.header_seen = false;
                        self.framer = Framer::default();
                        continue;
                    }
                    None => {
                        // Keepalive whitespace never accumulates.
                        if self.framer.between_items() {
                            self.consume(self.framer.pos);
                        }
                        return Ok(None);
                    }
                },
            };
            match self.parse_item(&self.buf[..end])? {
                Step::Incomplete => return Err(DecodeError::Malformed("unbalanced top-level element".into())),
                Step::Skip(consumed) => self.consume(consumed),
                Step::Event(event, consumed) => {
                    self.consume(consumed);
                    return Ok(Some(event));
                }
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.framer.shift(n);
        self.ready = match self.ready {
            Some(end) if end > n => Some(end - n),
            _ => None,
        };
    }

    fn parse_header(&mut self) -> Result<Step, DecodeError> {
        let mut reader = Reader::from_reader(self.buf.as_slice());
        reader.config_mut().check_end_names = false;
        loop {
            match reader.read_event() {
                Ok(Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) | Event::Text(_)) => continue,
                Ok(Event::Start(start)) => {
                    let (prefix, local) = split_qname(&start);
                    if local != "stream" {
                        return Err(DecodeError::NotAStream(qname(&start)));
                    }
                    let mut header = StreamHeader::default();
                    let mut scope = Scope::new();
                    for (key, value) in attributes(&start)? {
                        match key.as_str() {
                            "xmlns" => {
                                header.default_ns = Some(value.clone());
                                scope.insert(String::new(), value);
                            }
                            k if k.starts_with("xmlns:") => {
                                scope.insert(k["xmlns:".len()..].to_owned(), value);
                            }
                            "to" => header.to = Some(value),
                            "from" => header.from = Some(value),
                            "id" => header.id = Some(value),
                            "version" => header.version = Some(value),
                            _ => {}
                        }
                    }
                    header.stream_ns = scope.get(prefix.as_deref().unwrap_or("")).cloned();
                    let consumed = reader.buffer_position() as usize;
                    self.root = scope;
                    self.header_seen = true;
                    return Ok(Step::Event(InboundEvent::StreamOpened(header), consumed));
                }
                Ok(Event::Empty(start)) => return Err(DecodeError::NotAStream(qname(&start))),
                Ok(Event::End(_)) => return Err(DecodeError::Malformed("closing tag before stream header".into())),
                Ok(Event::CData(_)) => return Err(DecodeError::Malformed("character data before stream header".into())),
                Ok(Event::Eof) | Err(quick_xml::Error::Syntax(_)) => return Ok(Step::Incomplete),
                Err(e) => return Err(DecodeError::Malformed(e.to_string())),
            }
        }
    }

    fn parse_item(&self, buf: &[u8]) -> Result<Step, DecodeError> {
        let mut reader = Reader::from_reader(buf);
        reader.config_mut().check_end_names = false;

        // Open elements and the namespace scope each of them introduced.
        let mut stack: Vec<(Element, Scope)> = Vec::new();
        loop {
            let event = match reader.read_event() {
                Ok(ev) => ev,
                Err(quick_xml::Error::Syntax(_)) => return Ok(Step::Incomplete),
                Err(e) => return Err(DecodeError::Malformed(e.to_string())),
            };
            match event {
                Event::Start(start) => {
                    let (el, scope) = self.open_element(&start, &stack)?;
                    stack.push((el, scope));
                }
                Event::Empty(start) => {
                    let (el, _) = self.open_element(&start, &stack)?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.append_child(el),
                        None => {
                            let consumed = reader.buffer_position() as usize;
                            return Ok(Step::Event(InboundEvent::Element(el), consumed));
                        }
                    }
                }
                Event::End(_) => match stack.pop() {
                    // `</stream:stream>` at depth zero.
                    None => {
                        let consumed = reader.buffer_position() as usize;
                        return Ok(Step::Event(InboundEvent::StreamClosed, consumed));
                    }
                    Some((el, _)) => match stack.last_mut() {
                        Some((parent, _)) => parent.append_child(el),
                        None => {
                            let consumed = reader.buffer_position() as usize;
                            return Ok(Step::Event(InboundEvent::Element(el), consumed));
                        }
                    },
                },
                Event::Text(text) => {
                    let Some((el, _)) = stack.last_mut() else {
                        // Whitespace keepalives between stanzas.
                        let consumed = reader.buffer_position() as usize;
                        if consumed == 0 {
                            return Ok(Step::Incomplete);
                        }
                        return Ok(Step::Skip(consumed));
                    };
                    let text = text.unescape().map_err(|e| DecodeError::Malformed(e.to_string()))?;
                    if !text.is_empty() {
                        el.append_text(text.into_owned());
                    }
                }
                Event::CData(data) => match stack.last_mut() {
                    Some((el, _)) => el.append_text(String::from_utf8_lossy(&data.into_inner()).into_owned()),
                    None => return Ok(Step::Skip(reader.buffer_position() as usize)),
                },
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {
                    if stack.is_empty() {
                        return Ok(Step::Skip(reader.buffer_position() as usize));
                    }
                }
                Event::Eof => return Ok(Step::Incomplete),
            }
        }
    }

    fn open_element(&self, start: &BytesStart<'_>, stack: &[(Element, Scope)]) -> Result<(Element, Scope), DecodeError> {
        let (prefix, local) = split_qname(start);
        let mut scope = Scope::new();
        let mut attrs = Vec::new();
        for (key, value) in attributes(start)? {
            if key == "xmlns" {
                scope.insert(String::new(), value);
            } else if let Some(p) = key.strip_prefix("xmlns:") {
                scope.insert(p.to_owned(), value);
            } else {
                attrs.push((key, value));
            }
        }

        let resolve = |wanted: &str| {
            scope
                .get(wanted)
                .or_else(|| stack.iter().rev().find_map(|(_, s)| s.get(wanted)))
                .or_else(|| self.root.get(wanted))
                .cloned()
        };
        let ns = resolve(prefix.as_deref().unwrap_or(""))
            .unwrap_or_else(|| if prefix.is_none() { NS_SERVER.to_owned() } else { String::new() });

        let mut el = match &prefix {
            Some(p) => Element::prefixed(p.as_str(), local, ns),
            None => Element::new(local, ns),
        };
        for (k, v) in attrs {
            // Qualified attributes keep their binding so the element re-serializes standalone.
            if let Some((p, _)) = k.split_once(':') {
                if p != "xml" && prefix.as_deref() != Some(p) {
                    if let Some(attr_ns) = resolve(p) {
                        el.declare_prefix(p, attr_ns);
                    }
                }
            }
            el.set_attr(k, v);
        }
        Ok((el, scope))
    }
}

enum Step {
    Incomplete,
    Skip(usize),
    Event(InboundEvent, usize),
}

/// Lexical position of the framer inside the byte stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Lex {
    #[default]
    Text,
    Tag { closing: bool, quote: Option<u8>, slash: bool },
    Comment { dashes: u8 },
    CData { brackets: u8 },
    Pi { question: bool },
    Doctype { quote: Option<u8> },
}

/// A markup token the framer finished reading.
enum Token {
    Open,
    SelfClosed,
    Close,
    Other,
}

/// Boundary found by the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    /// A complete top-level item ends at this offset.
    Item(usize),
    /// A new `<stream:stream>` opened at depth zero.
    Header,
}

/// Finds top-level item boundaries without re-reading bytes it has seen.
#[derive(Debug, Default)]
struct Framer {
    /// Next unscanned offset into the decoder buffer.
    pos: usize,
    depth: usize,
    lex: Lex,
    item_start: Option<usize>,
}

impl Framer {
    /// Scan forward to the end of the next top-level item.
    fn scan(&mut self, buf: &[u8]) -> Result<Option<Frame>, DecodeError> {
        while self.pos < buf.len() {
            if let Some(start) = self.item_start {
                if self.pos - start >= MAX_STANZA_SIZE {
                    return Err(DecodeError::TooLarge);
                }
            }
            let byte = buf[self.pos];
            if self.lex == Lex::Text {
                if byte == b'<' {
                    let Some((lex, len)) = classify(&buf[self.pos..]) else {
                        return Ok(None);
                    };
                    if self.depth == 0 {
                        self.item_start.get_or_insert(self.pos);
                    }
                    self.lex = lex;
                    self.pos += len;
                } else {
                    self.pos += 1;
                }
                continue;
            }

            let token = match &mut self.lex {
                Lex::Text => None,
                Lex::Tag { closing, quote, slash } => match (*quote, byte) {
                    (Some(q), b) if b == q => {
                        *quote = None;
                        None
                    }
                    (Some(_), _) => None,
                    (None, b'"' | b'\'') => {
                        *quote = Some(byte);
                        None
                    }
                    (None, b'>') if *closing => Some(Token::Close),
                    (None, b'>') if *slash => Some(Token::SelfClosed),
                    (None, b'>') => Some(Token::Open),
                    (None, b'/') => {
                        *slash = true;
                        None
                    }
                    (None, _) => {
                        *slash = false;
                        None
                    }
                },
                Lex::Comment { dashes } => match byte {
                    b'-' => {
                        *dashes = (*dashes + 1).min(2);
                        None
                    }
                    b'>' if *dashes == 2 => Some(Token::Other),
                    _ => {
                        *dashes = 0;
                        None
                    }
                },
                Lex::CData { brackets } => match byte {
                    b']' => {
                        *brackets = (*brackets + 1).min(2);
                        None
                    }
                    b'>' if *brackets == 2 => Some(Token::Other),
                    _ => {
                        *brackets = 0;
                        None
                    }
                },
                Lex::Pi { question } => match byte {
                    b'>' if *question => Some(Token::Other),
                    _ => {
                        *question = byte == b'?';
                        None
                    }
                },
                Lex::Doctype { quote } => match (*quote, byte) {
                    (Some(q), b) if b == q => {
                        *quote = None;
                        None
                    }
                    (Some(_), _) => None,
                    (None, b'"' | b'\'') => {
                        *quote = Some(byte);
                        None
                    }
                    (None, b'>') => Some(Token::Other),
                    (None, _) => None,
                },
            };
            self.pos += 1;
            let Some(token) = token else { continue };
            self.lex = Lex::Text;
            let complete = match token {
                Token::Open if self.depth == 0 && self.item_start.is_some_and(|start| opens_stream(&buf[start..])) => {
                    self.item_start = None;
                    return Ok(Some(Frame::Header));
                }
                Token::Open => {
                    self.depth += 1;
                    false
                }
                Token::Close if self.depth > 1 => {
                    self.depth -= 1;
                    false
                }
                // Closing the last open element, or `</stream:stream>` itself.
                Token::Close => {
                    self.depth = 0;
                    true
                }
                Token::SelfClosed | Token::Other => self.depth == 0,
            };
            if complete {
                self.item_start = None;
                return Ok(Some(Frame::Item(self.pos)));
            }
        }
        Ok(None)
    }

    fn between_items(&self) -> bool {
        self.lex == Lex::Text && self.item_start.is_none()
    }

    /// The first `n` bytes of the buffer were consumed.
    fn shift(&mut self, n: usize) {
        self.pos = self.pos.saturating_sub(n);
        self.item_start = self.item_start.map(|start| start.saturating_sub(n));
    }
}

/// Classify the markup starting at `<`, or `None` if more bytes are needed.
fn classify(rest: &[u8]) -> Option<(Lex, usize)> {
    const COMMENT: &[u8] = b"<!--";
    const CDATA: &[u8] = b"<![CDATA[";
    match rest.get(1)? {
        b'/' => Some((Lex::Tag { closing: true, quote: None, slash: false }, 2)),
        b'?' => Some((Lex::Pi { question: false }, 2)),
        b'!' => {
            if rest.starts_with(COMMENT) {
                return Some((Lex::Comment { dashes: 0 }, COMMENT.len()));
            }
            if rest.starts_with(CDATA) {
                return Some((Lex::CData { brackets: 0 }, CDATA.len()));
            }
            if COMMENT.starts_with(rest) || CDATA.starts_with(rest) {
                return None;
            }
            Some((Lex::Doctype { quote: None }, 2))
        }
        _ => Some((Lex::Tag { closing: false, quote: None, slash: false }, 1)),
    }
}

/// Whether the start tag at the head of `tag` is `<stream>` under any prefix.
fn opens_stream(tag: &[u8]) -> bool {
    let name = tag.get(1..).unwrap_or_default();
    let end = name
        .iter()
        .position(|b| b.is_ascii_whitespace() || matches!(b, b'>' | b'/'))
        .unwrap_or(name.len());
    let name = &name[..end];
    name == b"stream" || name.ends_with(b":stream")
}

fn qname(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn split_qname(start: &BytesStart<'_>) -> (Option<String>, String) {
    let name = qname(start);
    match name.split_once(':') {
        Some((p, l)) => (Some(p.to_owned()), l.to_owned()),
        None => (None, name),
    }
}

fn attributes(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, DecodeError> {
    start
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| DecodeError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| DecodeError::Malformed(e.to_string()))?;
            Ok((key, value.into_owned()))
        })
        .collect()
}
