//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call nexus_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = with_defaults(config::Config::builder())?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (NEXUS_SERVER__NAME, NEXUS_S2S__MAX_OUT_CONNS, etc.)
        .add_source(
            config::Environment::with_prefix("NEXUS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("server.hosted_domains")
                .with_list_parse_key("s2s.tls_skip_hosts")
                .with_list_parse_key("s2s.sasl_skip_domains"),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration from an inline TOML document layered over the defaults.
///
/// Does not touch the global config; used by tests and by embedders that
/// manage their own settings.
pub fn load_from_str(toml: &str) -> Result<AppConfig, config::ConfigError> {
    let cfg = with_defaults(config::Config::builder())?
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    builder
        .set_default("server.name", "localhost")?
        .set_default("server.hosted_domains", Vec::<String>::new())?
        .set_default("s2s.max_out_conns", 4)?
        .set_default("s2s.max_in_conns", 4)?
        .set_default("s2s.max_waiting_stanzas", 1000)?
        .set_default("s2s.max_packet_waiting_secs", 420)? // 7 min
        .set_default("s2s.max_inactivity_secs", 900)? // 15 min
        .set_default("s2s.auth_timeout_secs", 30)?
        .set_default("s2s.verify_timeout_ms", 10_000)?
        .set_default("s2s.connect_timeout_secs", 15)?
        .set_default("s2s.tls_mode", "optional")?
        .set_default("s2s.tls_skip_hosts", Vec::<String>::new())?
        .set_default("s2s.sasl_skip_domains", Vec::<String>::new())?
        .set_default("s2s.compression_enabled", false)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub s2s: S2sConfig,
}

impl AppConfig {
    /// Reject values that would make the federation layer unusable.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(config::ConfigError::Message("server.name must not be empty".into()));
        }
        if self.s2s.max_out_conns == 0 {
            return Err(config::ConfigError::Message("s2s.max_out_conns must be at least 1".into()));
        }
        if self.s2s.max_waiting_stanzas == 0 {
            return Err(config::ConfigError::Message("s2s.max_waiting_stanzas must be at least 1".into()));
        }
        if self.s2s.max_in_conns == 0 {
            return Err(config::ConfigError::Message("s2s.max_in_conns must be at least 1".into()));
        }
        if self.s2s.verify_timeout_ms == 0 || self.s2s.auth_timeout_secs == 0 {
            return Err(config::ConfigError::Message("s2s timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Every domain served by this process: the primary name plus virtual hosts, lowercased.
    pub fn local_domains(&self) -> Vec<String> {
        let mut domains = vec![self.server.name.to_lowercase()];
        for d in &self.server.hosted_domains {
            let d = d.trim().to_lowercase();
            if !d.is_empty() && !domains.contains(&d) {
                domains.push(d);
            }
        }
        domains
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Primary domain of this server (e.g. "nexus.example.com").
    /// Maps to the `NEXUS_SERVER__NAME` env var or `server.name` in config.toml.
    pub name: String,
    /// Additional locally hosted domains (virtual hosts).
    pub hosted_domains: Vec<String>,
}

/// Server-to-server federation settings.
#[derive(Debug, Deserialize, Clone)]
pub struct S2sConfig {
    /// Maximum outgoing connections pooled per (local, remote) domain pair.
    pub max_out_conns: usize,
    /// Maximum incoming sessions accepted per domain pair.
    pub max_in_conns: usize,
    /// Stanzas queued per domain pair while no connection is available.
    pub max_waiting_stanzas: usize,
    /// Queued stanzas older than this are bounced back to the sender.
    pub max_packet_waiting_secs: u64,
    /// Idle sessions are closed after this many seconds without traffic.
    pub max_inactivity_secs: u64,
    /// A session must authenticate within this window.
    pub auth_timeout_secs: u64,
    /// Deadline for a dialback verification round-trip.
    pub verify_timeout_ms: u64,
    /// Deadline for establishing an outbound transport.
    pub connect_timeout_secs: u64,
    pub tls_mode: TlsMode,
    /// Peers that are never asked to start TLS.
    ///
    /// This is an interoperability escape hatch for known-broken remote
    /// servers, not a security policy. Every entry weakens the link to that peer.
    pub tls_skip_hosts: Vec<String>,
    /// Domains, local or remote, that never use SASL EXTERNAL and always fall back to dialback.
    pub sasl_skip_domains: Vec<String>,
    /// Offer and accept zlib stream compression.
    pub compression_enabled: bool,
    /// Shared dialback secret. A random one is generated when unset.
    pub dialback_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Never offer or request StartTLS.
    Disabled,
    /// Use StartTLS whenever the peer supports it.
    #[default]
    Optional,
    /// Refuse to federate over a stream that did not negotiate TLS.
    Required,
}
