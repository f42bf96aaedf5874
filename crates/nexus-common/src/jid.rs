//! XMPP address (JID) parsing.
//!
//! Federation only needs the structural parts of an address: the domain for
//! routing and the full string as a stable sender identity. Stringprep/PRECIS
//! normalisation beyond lowercasing the domain is left to the session manager.

use std::fmt;
use std::str::FromStr;

/// Maximum length of any single JID part, in bytes (RFC 7622 §3).
const MAX_PART_LEN: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    #[error("JID is empty")]
    Empty,
    #[error("JID has an empty {0} part")]
    EmptyPart(&'static str),
    #[error("JID {0} part exceeds {MAX_PART_LEN} bytes")]
    TooLong(&'static str),
    #[error("JID domain contains invalid character {0:?}")]
    InvalidDomainChar(char),
}

/// A parsed `node@domain/resource` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn parse(s: &str) -> Result<Self, JidError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        // Resource may itself contain '@' or '/', so split it off first.
        let (bare, resource) = match s.split_once('/') {
            Some((bare, res)) => (bare, Some(res)),
            None => (s, None),
        };
        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, bare),
        };

        let node = node.map(|n| check_part(n, "node")).transpose()?;
        let resource = resource.map(|r| check_part(r, "resource")).transpose()?;
        let domain = check_part(domain, "domain")?;
        if let Some(c) = domain.chars().find(|c| c.is_whitespace() || matches!(c, '@' | '/' | '<' | '>' | '\'' | '"')) {
            return Err(JidError::InvalidDomainChar(c));
        }

        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return Err(JidError::EmptyPart("domain"));
        }

        Ok(Self {
            node,
            domain: domain.to_lowercase(),
            resource,
        })
    }

    /// A domain-only JID, as used for server addresses.
    pub fn domain_only(domain: &str) -> Result<Self, JidError> {
        let jid = Self::parse(domain)?;
        Ok(Self { node: None, domain: jid.domain, resource: None })
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource.
    pub fn bare(&self) -> Jid {
        Jid { node: self.node.clone(), domain: self.domain.clone(), resource: None }
    }
}

fn check_part(part: &str, which: &'static str) -> Result<String, JidError> {
    if part.is_empty() {
        return Err(JidError::EmptyPart(which));
    }
    if part.len() > MAX_PART_LEN {
        return Err(JidError::TooLong(which));
    }
    Ok(part.to_owned())
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(res) = &self.resource {
            write!(f, "/{res}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_jid() {
        let jid = Jid::parse("alice@A.Example/phone").unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "a.example");
        assert_eq!(jid.resource(), Some("phone"));
        assert_eq!(jid.to_string(), "alice@a.example/phone");
        assert_eq!(jid.bare().to_string(), "alice@a.example");
    }

    #[test]
    fn resource_may_contain_separators() {
        let jid = Jid::parse("a.example/x@y/z").unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.resource(), Some("x@y/z"));
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Jid::parse(""), Err(JidError::Empty));
        assert_eq!(Jid::parse("@a.example"), Err(JidError::EmptyPart("node")));
        assert_eq!(Jid::parse("u@"), Err(JidError::EmptyPart("domain")));
        assert!(matches!(Jid::parse("u@bad host"), Err(JidError::InvalidDomainChar(' '))));
        assert_eq!(Jid::parse(&"x".repeat(1024)), Err(JidError::TooLong("domain")));
    }

    #[test]
    fn root_label_alone_is_not_a_domain() {
        assert_eq!(Jid::parse("."), Err(JidError::EmptyPart("domain")));
        assert_eq!(Jid::parse("u@.."), Err(JidError::EmptyPart("domain")));
        assert_eq!(Jid::parse("u@b.example.").unwrap().domain(), "b.example");
    }
}
