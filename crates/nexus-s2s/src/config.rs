//! Runtime settings of a [`FederationRouter`](crate::FederationRouter).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nexus_common::config::{AppConfig, TlsMode};

use crate::cid::HostedDomains;
use crate::key::{RotatingSecret, SecretProvider};
use crate::pipeline::StageEnv;

pub const DEFAULT_MAX_OUT_CONNS: usize = 4;
pub const DEFAULT_MAX_IN_CONNS: usize = 4;
pub const DEFAULT_MAX_WAITING_STANZAS: usize = 1000;
/// Seven minutes, after which a queued stanza is bounced.
pub const DEFAULT_MAX_PACKET_WAITING: Duration = Duration::from_secs(7 * 60);
/// Fifteen minutes without traffic closes a session.
pub const DEFAULT_MAX_INACTIVITY: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub hosted: HostedDomains,
    /// Primary local domain; assumed target of incoming streams without `to`.
    pub default_domain: String,
    pub max_out_conns: usize,
    pub max_in_conns: usize,
    pub max_waiting_stanzas: usize,
    pub max_packet_waiting: Duration,
    pub max_inactivity: Duration,
    pub auth_timeout: Duration,
    pub verify_timeout: Duration,
    pub connect_timeout: Duration,
    pub tls_mode: TlsMode,
    pub tls_skip_hosts: HashSet<String>,
    /// Certificate authentication is never offered to or attempted with these domains.
    pub sasl_skip_domains: HashSet<String>,
    pub compression: bool,
    pub dialback_secret: Option<String>,
}

impl RouterConfig {
    /// Defaults for a server hosting `domains`; the first one is primary.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains: Vec<String> = domains.into_iter().map(|d| d.as_ref().to_lowercase()).collect();
        Self {
            default_domain: domains.first().cloned().unwrap_or_else(|| "localhost".to_owned()),
            hosted: HostedDomains::new(&domains),
            max_out_conns: DEFAULT_MAX_OUT_CONNS,
            max_in_conns: DEFAULT_MAX_IN_CONNS,
            max_waiting_stanzas: DEFAULT_MAX_WAITING_STANZAS,
            max_packet_waiting: DEFAULT_MAX_PACKET_WAITING,
            max_inactivity: DEFAULT_MAX_INACTIVITY,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls_mode: TlsMode::default(),
            tls_skip_hosts: HashSet::new(),
            sasl_skip_domains: HashSet::new(),
            compression: false,
            dialback_secret: None,
        }
    }

    /// Secret source for dialback keys: the configured passphrase, or a
    /// random secret that lives as long as the process.
    pub fn secret_provider(&self) -> Arc<RotatingSecret> {
        match &self.dialback_secret {
            Some(passphrase) => Arc::new(RotatingSecret::from_passphrase(passphrase)),
            None => Arc::new(RotatingSecret::generate()),
        }
    }

    pub(crate) fn stage_env(&self, secrets: Arc<dyn SecretProvider>) -> StageEnv {
        let mut env = StageEnv::new(self.hosted.clone(), self.default_domain.clone(), secrets);
        env.tls_mode = self.tls_mode;
        env.tls_skip_hosts = self.tls_skip_hosts.clone();
        env.sasl_skip_domains = self.sasl_skip_domains.clone();
        env.compression = self.compression;
        env
    }
}

impl From<&AppConfig> for RouterConfig {
    fn from(cfg: &AppConfig) -> Self {
        let s2s = &cfg.s2s;
        Self {
            max_out_conns: s2s.max_out_conns,
            max_in_conns: s2s.max_in_conns,
            max_waiting_stanzas: s2s.max_waiting_stanzas,
            max_packet_waiting: Duration::from_secs(s2s.max_packet_waiting_secs),
            max_inactivity: Duration::from_secs(s2s.max_inactivity_secs),
            auth_timeout: Duration::from_secs(s2s.auth_timeout_secs),
            verify_timeout: Duration::from_millis(s2s.verify_timeout_ms),
            connect_timeout: Duration::from_secs(s2s.connect_timeout_secs),
            tls_mode: s2s.tls_mode,
            tls_skip_hosts: s2s.tls_skip_hosts.iter().map(|h| h.trim().to_lowercase()).collect(),
            sasl_skip_domains: s2s.sasl_skip_domains.iter().map(|d| d.trim().to_lowercase()).collect(),
            compression: s2s.compression_enabled,
            dialback_secret: s2s.dialback_secret.clone(),
            ..Self::new(cfg.local_domains())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_from_app_config() {
        let app = nexus_common::config::load_from_str(
            r#"
            [server]
            name = "a.example"
            hosted_domains = ["chat.a.example"]

            [s2s]
            max_out_conns = 2
            verify_timeout_ms = 250
            tls_skip_hosts = ["Legacy.Example"]
            sasl_skip_domains = ["Old.Example"]
            "#,
        )
        .unwrap();
        let cfg = RouterConfig::from(&app);
        assert_eq!(cfg.default_domain, "a.example");
        assert!(cfg.hosted.contains("chat.a.example"));
        assert_eq!(cfg.max_out_conns, 2);
        assert_eq!(cfg.verify_timeout, Duration::from_millis(250));
        assert!(cfg.tls_skip_hosts.contains("legacy.example"));
        assert!(cfg.sasl_skip_domains.contains("old.example"));
        assert_eq!(cfg.max_packet_waiting, DEFAULT_MAX_PACKET_WAITING);
    }

    #[test]
    fn configured_passphrase_is_deterministic() {
        let mut cfg = RouterConfig::new(["a.example"]);
        cfg.dialback_secret = Some("s3cret".into());
        assert_eq!(cfg.secret_provider().current(), cfg.secret_provider().current());
    }
}
