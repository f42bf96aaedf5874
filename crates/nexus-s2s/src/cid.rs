//! Connection identity of a federation link.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::S2sError;

/// The `(local domain, remote domain)` pair a federation link serves.
///
/// Sole key for connection pooling and for authentication results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    local: String,
    remote: String,
}

impl Cid {
    pub fn new(local: impl AsRef<str>, remote: impl AsRef<str>) -> Self {
        Self { local: local.as_ref().to_lowercase(), remote: remote.as_ref().to_lowercase() }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.remote)
    }
}

/// The set of domains served locally.
#[derive(Debug, Clone, Default)]
pub struct HostedDomains(Arc<HashSet<String>>);

impl HostedDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(Arc::new(domains.into_iter().map(|d| d.as_ref().to_lowercase()).collect()))
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains(&domain.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Build the CID for a link a peer claims to be opening to us.
    ///
    /// `local` must be hosted here and `remote` must not be.
    pub fn incoming_cid(&self, local: &str, remote: &str) -> Result<Cid, S2sError> {
        if !self.contains(local) {
            return Err(S2sError::NotLocalHost(local.to_owned()));
        }
        if self.contains(remote) {
            return Err(S2sError::LocalHost(remote.to_owned()));
        }
        Ok(Cid::new(local, remote))
    }
}
