//! S2S wire vocabulary: namespaces, the stream header, stream errors and the
//! negotiation elements exchanged before a stream is established.

use std::fmt;
use std::str::FromStr;

use quick_xml::escape::escape;

use crate::xml::Element;

// ─── Namespaces ──────────────────────────────────────────────────────────────

pub const NS_SERVER: &str = "jabber:server";
pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_DIALBACK: &str = "jabber:server:dialback";
pub const NS_DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const NS_COMPRESS: &str = "http://jabber.org/protocol/compress";
pub const NS_COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// The only SASL mechanism used between servers.
pub const SASL_EXTERNAL: &str = "EXTERNAL";

/// The only compression method offered or accepted.
pub const COMPRESSION_ZLIB: &str = "zlib";

pub const STREAM_VERSION: &str = "1.0";

// ─── Stream header ───────────────────────────────────────────────────────────

/// Attributes of an opening `<stream:stream>` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    /// Default namespace declared by the peer (`xmlns`).
    pub default_ns: Option<String>,
    /// Namespace bound to the element's prefix (normally `xmlns:stream`).
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    /// A header as this server sends it.
    pub fn ours(from: Option<&str>, to: Option<&str>, id: Option<&str>, version: bool) -> Self {
        Self {
            to: to.map(str::to_owned),
            from: from.map(str::to_owned),
            id: id.map(str::to_owned),
            version: version.then(|| STREAM_VERSION.to_owned()),
            default_ns: Some(NS_SERVER.to_owned()),
            stream_ns: Some(NS_STREAMS.to_owned()),
        }
    }

    /// True when the peer declared XMPP 1.0 or later, i.e. it will negotiate features.
    pub fn supports_features(&self) -> bool {
        self.version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse::<u32>().ok())
            .is_some_and(|major| major >= 1)
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<stream:stream");
        let mut attr = |k: &str, v: &str| {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v));
            out.push('\'');
        };
        attr("xmlns", self.default_ns.as_deref().unwrap_or(NS_SERVER));
        attr("xmlns:stream", self.stream_ns.as_deref().unwrap_or(NS_STREAMS));
        attr("xmlns:db", NS_DIALBACK);
        if let Some(v) = &self.version {
            attr("version", v);
        }
        if let Some(v) = &self.from {
            attr("from", v);
        }
        if let Some(v) = &self.to {
            attr("to", v);
        }
        if let Some(v) = &self.id {
            attr("id", v);
        }
        out.push('>');
        out
    }
}

pub const STREAM_CLOSE: &str = "</stream:stream>";

// ─── Stream errors ───────────────────────────────────────────────────────────

/// RFC 6120 §4.9.3 stream error conditions used by the federation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorCondition {
    BadFormat,
    ConnectionTimeout,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    NotAuthorized,
    PolicyViolation,
    RemoteConnectionFailed,
    ResourceConstraint,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::ResourceConstraint => "resource-constraint",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }

    /// `<stream:error><CONDITION xmlns='…'/></stream:error>`
    pub fn to_element(&self) -> Element {
        Element::prefixed("stream", "error", NS_STREAMS)
            .with_child(Element::new(self.as_str(), NS_STREAM_ERRORS))
    }

    /// Read the condition out of a received `<stream:error/>`.
    pub fn from_element(el: &Element) -> Option<Self> {
        el.children()
            .filter(|c| c.ns() == NS_STREAM_ERRORS && c.name() != "text")
            .find_map(|c| c.name().parse().ok())
    }
}

impl FromStr for StreamErrorCondition {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bad-format" => Self::BadFormat,
            "connection-timeout" => Self::ConnectionTimeout,
            "host-unknown" => Self::HostUnknown,
            "improper-addressing" => Self::ImproperAddressing,
            "internal-server-error" => Self::InternalServerError,
            "invalid-from" => Self::InvalidFrom,
            "invalid-namespace" => Self::InvalidNamespace,
            "not-authorized" => Self::NotAuthorized,
            "policy-violation" => Self::PolicyViolation,
            "remote-connection-failed" => Self::RemoteConnectionFailed,
            "resource-constraint" => Self::ResourceConstraint,
            "system-shutdown" => Self::SystemShutdown,
            "undefined-condition" => Self::UndefinedCondition,
            "unsupported-stanza-type" => Self::UnsupportedStanzaType,
            "unsupported-version" => Self::UnsupportedVersion,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Negotiation elements ────────────────────────────────────────────────────

pub fn features(children: Vec<Element>) -> Element {
    children
        .into_iter()
        .fold(Element::prefixed("stream", "features", NS_STREAMS), Element::with_child)
}

pub fn is_features(el: &Element) -> bool {
    el.is("features", NS_STREAMS)
}

pub fn is_stream_error(el: &Element) -> bool {
    el.is("error", NS_STREAMS)
}

pub fn starttls() -> Element {
    Element::new("starttls", NS_TLS)
}

pub fn proceed() -> Element {
    Element::new("proceed", NS_TLS)
}

pub fn tls_failure() -> Element {
    Element::new("failure", NS_TLS)
}

pub fn compress(method: &str) -> Element {
    Element::new("compress", NS_COMPRESS).with_child(Element::new("method", NS_COMPRESS).with_text(method))
}

pub fn compressed() -> Element {
    Element::new("compressed", NS_COMPRESS)
}

pub fn compress_failure(reason: &str) -> Element {
    Element::new("failure", NS_COMPRESS).with_child(Element::new(reason, NS_COMPRESS))
}

pub fn sasl_mechanisms(mechanisms: &[&str]) -> Element {
    mechanisms.iter().fold(Element::new("mechanisms", NS_SASL), |el, m| {
        el.with_child(Element::new("mechanism", NS_SASL).with_text(*m))
    })
}

/// True if `features` lists `mechanism` under `<mechanisms/>`.
pub fn offers_mechanism(features: &Element, mechanism: &str) -> bool {
    features
        .get_child("mechanisms", NS_SASL)
        .is_some_and(|m| m.children().any(|c| c.is("mechanism", NS_SASL) && c.text().trim() == mechanism))
}

/// `<auth/>` carrying an already encoded authorization identity (`=` for none).
pub fn sasl_auth(mechanism: &str, authzid: &str) -> Element {
    Element::new("auth", NS_SASL).with_attr("mechanism", mechanism).with_text(authzid)
}

pub fn sasl_success() -> Element {
    Element::new("success", NS_SASL)
}

pub fn sasl_failure(condition: &str, text: Option<&str>) -> Element {
    let mut failure = Element::new("failure", NS_SASL).with_child(Element::new(condition, NS_SASL));
    if let Some(text) = text {
        failure.append_child(Element::new("text", NS_SASL).with_attr("xml:lang", "en").with_text(text));
    }
    failure
}

/// `<db:result/>` or `<db:verify/>`.
pub fn dialback(
    name: &str,
    from: &str,
    to: &str,
    id: Option<&str>,
    kind: Option<&str>,
    key: Option<&str>,
) -> Element {
    let mut el = Element::prefixed("db", name, NS_DIALBACK).with_attr("from", from).with_attr("to", to);
    if let Some(id) = id {
        el.set_attr("id", id);
    }
    if let Some(kind) = kind {
        el.set_attr("type", kind);
    }
    if let Some(key) = key {
        el.append_text(key);
    }
    el
}

/// Stanza error conditions used when bouncing stanzas that cannot be federated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceCondition {
    RemoteServerNotFound,
    RemoteServerTimeout,
    ServiceUnavailable,
}

impl BounceCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }
}

impl fmt::Display for BounceCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the error reply for a stanza that could not be delivered.
///
/// Returns `None` for stanzas that must never be answered with an error
/// (errors themselves and `result` IQs), to avoid bounce loops.
pub fn bounce(stanza: &Element, condition: BounceCondition, text: &str) -> Option<Element> {
    if matches!(stanza.attr("type"), Some("error") | Some("result")) {
        return None;
    }
    let mut reply = Element::new(stanza.name(), stanza.ns()).with_attr("type", "error");
    for (k, v) in stanza.attrs() {
        match k {
            "to" => reply.set_attr("from", v),
            "from" => reply.set_attr("to", v),
            "type" => {}
            _ => reply.set_attr(k, v),
        }
    }
    reply.append_child(
        Element::new("error", stanza.ns())
            .with_attr("type", "cancel")
            .with_child(Element::new(condition.as_str(), NS_STANZAS))
            .with_child(Element::new("text", NS_STANZAS).with_text(text)),
    );
    Some(reply)
}
