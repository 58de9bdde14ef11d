//! Plain configuration structs for the control surface's embedder,
//! named and defaulted per §6 "Configuration". Loading these from a
//! file or environment is out of scope here, the way the teacher never
//! ships a config-file loader either — only the shape and defaults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connections: usize,
    /// Lower tries first; used for both posting (primary only, §4.5) and
    /// retrieval fallback ordering.
    pub priority: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 563,
            tls: true,
            username: None,
            password: None,
            max_connections: 4,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub servers: Vec<ServerConfig>,
    /// §4.3: nominal segment size, tunable at folder-create time,
    /// immutable per folder afterward (Open Question decision 1).
    pub segment_size: u64,
    pub max_attempts: u32,
    pub idle_timeout_s: u64,
    /// Passed to `Identity::ensure_identity` as its `intent` tag (§4.1).
    /// Fixed per installation; changing it against a populated secret
    /// store is what trips `AlreadyInitialized`.
    pub identity_intent: String,
    pub newsgroup: String,
    pub message_id_domain: String,
    pub download_root: String,
    /// Article `From` header display name; not a recognized config key
    /// in §6 but needed to format a wire article at all, so it gets the
    /// same "UsenetSync" default the Message-ID domain implies.
    pub from_display_name: String,
    pub from_address: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            segment_size: 768_000,
            max_attempts: 5,
            idle_timeout_s: 300,
            identity_intent: "usenetsync-core".to_string(),
            newsgroup: "alt.binaries.test".to_string(),
            message_id_domain: "ngPost.com".to_string(),
            download_root: String::new(),
            from_display_name: "UsenetSync".to_string(),
            from_address: "poster@ngpost.com".to_string(),
        }
    }
}

/// Builds a live NNTP connection pool for `server`, threading
/// `idle_timeout_s` into the pool's recycle health check (§4.5) so idle
/// sockets are replaced instead of handed back out stale.
pub fn build_transport_pool(server: &ServerConfig, idle_timeout_s: u64) -> anyhow::Result<usync_nntp::NntpPool> {
    let endpoint = usync_nntp::ServerEndpoint {
        host: server.host.clone(),
        port: server.port,
        username: server.username.clone(),
        password: server.password.clone(),
        max_connections: server.max_connections,
    };
    let tls_connector = usync_nntp::default_tls_connector()?;
    usync_nntp::build_pool(endpoint, tls_connector, std::time::Duration::from_secs(idle_timeout_s))
}
