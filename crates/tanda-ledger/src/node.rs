//! Tanda Node - the main application entry point.
//!
//! Architecture:
//! - Single daemon process with one shared pool store
//! - HTTP API for clients (pools, status, credit reports)
//! - Unix admin socket for local admin ops (tanda-admin CLI)

use crate::admin_socket::AdminSocket;
use crate::api;
use crate::chain::{ChainReader, HttpChainReader, InMemoryChainReader};
use crate::eligibility::{EligibilityGate, HttpScoreSource};
use crate::error::{Error, Result};
use crate::service::PoolService;
use crate::storage::{PoolStore, LEDGER_FILE};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a Tanda node.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Data directory holding the pool ledger
    pub data_dir: PathBuf,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Admin socket path (for tanda-admin CLI)
    pub admin_socket: PathBuf,

    /// Base URL of the scoring service
    pub score_url: String,

    /// Per-lookup scoring timeout
    pub score_timeout: Duration,

    /// Base URL of the on-chain state gateway
    pub chain_gateway: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./tanda-data");
        Self {
            admin_socket: data_dir.join("admin.sock"),
            data_dir,
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            score_url: "https://credit.cash".to_string(),
            score_timeout: Duration::from_millis(5000),
            chain_gateway: None,
        }
    }
}

impl LedgerConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let data_dir = var("TANDA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let api_addr = match var("TANDA_API_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("Invalid TANDA_API_ADDR {:?}: {}", raw, e)))?,
            None => defaults.api_addr,
        };

        let admin_socket = var("TANDA_ADMIN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("admin.sock"));

        let score_url = var("TANDA_SCORE_URL").unwrap_or(defaults.score_url);

        let score_timeout = match var("TANDA_SCORE_TIMEOUT_MS") {
            Some(raw) => raw.trim().parse().map(Duration::from_millis).map_err(|e| {
                Error::Config(format!("Invalid TANDA_SCORE_TIMEOUT_MS {:?}: {}", raw, e))
            })?,
            None => defaults.score_timeout,
        };

        let chain_gateway = var("TANDA_CHAIN_GATEWAY")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            data_dir,
            api_addr,
            admin_socket,
            score_url,
            score_timeout,
            chain_gateway,
        })
    }

    /// Path of the pool ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }
}

/// A Tanda node instance.
pub struct LedgerNode {
    service: PoolService,
    config: LedgerConfig,
}

impl LedgerNode {
    /// Create a new node: open the store and connect the collaborators.
    pub async fn new(config: LedgerConfig) -> Result<Self> {
        // Ensure data directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        // Open single shared store
        let store = Arc::new(PoolStore::open(config.ledger_path())?);

        let scores = HttpScoreSource::new(config.score_url.clone(), config.score_timeout)?;
        let gate = EligibilityGate::new(Arc::new(scores)).with_timeout(config.score_timeout);

        let chain: Arc<dyn ChainReader> = match &config.chain_gateway {
            Some(gateway) => Arc::new(HttpChainReader::new(gateway.clone(), config.score_timeout)?),
            None => {
                tracing::warn!("TANDA_CHAIN_GATEWAY not set; pool status requests will fail");
                Arc::new(InMemoryChainReader::new())
            }
        };

        Ok(Self {
            service: PoolService::new(store, gate, chain),
            config,
        })
    }

    /// Get the pool service (for API handlers).
    pub fn service(&self) -> &PoolService {
        &self.service
    }

    /// Run the node (starts HTTP server and admin socket).
    pub async fn run(self) -> Result<()> {
        tracing::info!("Tanda node starting");
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Admin: {:?}", self.config.admin_socket);
        tracing::info!("  Data: {:?}", self.config.data_dir);
        tracing::info!("  Pools: {}", self.service.store().len());

        // Start admin socket server in background
        let admin_socket = AdminSocket::new(
            Arc::clone(self.service.store()),
            self.config.admin_socket.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = admin_socket.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });

        // Build HTTP API
        let app = api::build_router(self.service.clone());

        // Start HTTP server
        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<LedgerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LedgerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./tanda-data"));
        assert_eq!(config.admin_socket, PathBuf::from("./tanda-data/admin.sock"));
        assert_eq!(config.api_addr.port(), 8080);
        assert_eq!(config.score_timeout, Duration::from_secs(5));
        assert!(config.chain_gateway.is_none());
        assert_eq!(config.ledger_path(), PathBuf::from("./tanda-data/pools.json"));
    }

    #[test]
    fn admin_socket_follows_data_dir() {
        let config = config(&[
            ("TANDA_DATA_DIR", "/var/lib/tanda"),
            ("TANDA_CHAIN_GATEWAY", "http://gw"),
        ])
        .unwrap();
        assert_eq!(config.admin_socket, PathBuf::from("/var/lib/tanda/admin.sock"));
        assert_eq!(config.chain_gateway.as_deref(), Some("http://gw"));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        assert!(matches!(
            config(&[("TANDA_API_ADDR", "not-an-addr")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config(&[("TANDA_SCORE_TIMEOUT_MS", "soon")]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn node_opens_store_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig {
            data_dir: dir.path().join("data"),
            ..LedgerConfig::default()
        };
        let node = LedgerNode::new(config).await.unwrap();
        assert!(node.service().list_pools().is_empty());
        assert_eq!(
            node.service().store().path(),
            Some(dir.path().join("data").join(LEDGER_FILE).as_path())
        );
    }
}
