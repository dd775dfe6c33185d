//! Unix socket server for admin commands.
//!
//! Provides a local IPC interface for inspecting pools and checking or
//! repairing the membership index.

use crate::error::Result;
use crate::models::{Address, Pool};
use crate::storage::{ConsistencyFault, PoolStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Admin command sent over the socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Ping (health check)
    Ping,
    /// List every pool
    ListPools,
    /// Show one pool
    GetPool { pool: String },
    /// List the pools a participant belongs to
    PoolsFor { participant: String },
    /// Report index inconsistencies without changing anything
    Verify,
    /// Fix index inconsistencies and persist the result
    Repair,
}

/// Response from admin command.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    Pools { pools: Vec<Pool> },
    Pool { pool: Pool },
    Faults { faults: Vec<ConsistencyFault> },
    Pong,
}

/// Admin socket server.
pub struct AdminSocket {
    store: Arc<PoolStore>,
    socket_path: PathBuf,
}

impl AdminSocket {
    /// Create a new admin socket server.
    pub fn new(store: Arc<PoolStore>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            socket_path: socket_path.into(),
        }
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        // Remove existing socket file if present
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {}", self.socket_path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let store = Arc::clone(&self.store);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, store).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, store: Arc<PoolStore>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => execute_command(cmd, &store),
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

fn error(e: impl ToString) -> AdminResponse {
    AdminResponse::Error {
        error: e.to_string(),
    }
}

fn execute_command(cmd: AdminCommand, store: &PoolStore) -> AdminResponse {
    match cmd {
        AdminCommand::Ping => AdminResponse::Pong,

        AdminCommand::ListPools => AdminResponse::Pools {
            pools: store.list_pools(),
        },

        AdminCommand::GetPool { pool } => {
            match Address::parse(&pool).and_then(|id| store.get_pool(&id)) {
                Ok(pool) => AdminResponse::Pool { pool },
                Err(e) => error(e),
            }
        }

        AdminCommand::PoolsFor { participant } => match Address::parse(&participant) {
            Ok(participant) => AdminResponse::Pools {
                pools: store.list_pools_for(&participant),
            },
            Err(e) => error(e),
        },

        AdminCommand::Verify => AdminResponse::Faults {
            faults: store.verify(),
        },

        AdminCommand::Repair => match store.repair() {
            Ok(fixed) if fixed.is_empty() => AdminResponse::Ok {
                message: "Index consistent; nothing to repair".to_string(),
            },
            Ok(fixed) => {
                tracing::info!("Repaired {} index fault(s) via admin socket", fixed.len());
                AdminResponse::Faults { faults: fixed }
            }
            Err(e) => error(e),
        },
    }
}

/// Default socket path.
pub fn default_socket_path() -> PathBuf {
    let data_dir = std::env::var("TANDA_DATA_DIR").unwrap_or_else(|_| "./tanda-data".to_string());
    Path::new(&data_dir).join("admin.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{}", hex::encode([n; 20]))).unwrap()
    }

    fn store() -> PoolStore {
        let store = PoolStore::in_memory();
        let pool = Pool::new(addr(0xaa), "Friends".into(), vec![addr(1), addr(2)], 100, 60);
        store.create_pool(pool, &addr(1)).unwrap();
        store
    }

    #[test]
    fn commands_parse_from_json_lines() {
        let cmd: AdminCommand =
            serde_json::from_str(r#"{"cmd":"pools_for","participant":"0xab"}"#).unwrap();
        assert!(matches!(cmd, AdminCommand::PoolsFor { participant } if participant == "0xab"));
        assert!(matches!(
            serde_json::from_str::<AdminCommand>(r#"{"cmd":"ping"}"#).unwrap(),
            AdminCommand::Ping
        ));
    }

    #[test]
    fn lookups() {
        let store = store();
        assert!(matches!(execute_command(AdminCommand::Ping, &store), AdminResponse::Pong));

        match execute_command(AdminCommand::ListPools, &store) {
            AdminResponse::Pools { pools } => assert_eq!(pools.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }

        let get = AdminCommand::GetPool {
            pool: addr(0xaa).to_string().to_uppercase().replacen("0X", "0x", 1),
        };
        assert!(matches!(execute_command(get, &store), AdminResponse::Pool { .. }));

        let missing = AdminCommand::GetPool {
            pool: addr(0xbb).to_string(),
        };
        assert!(matches!(execute_command(missing, &store), AdminResponse::Error { .. }));

        let bad = AdminCommand::PoolsFor {
            participant: "nobody".into(),
        };
        assert!(matches!(execute_command(bad, &store), AdminResponse::Error { .. }));
    }

    #[test]
    fn verify_and_repair_on_consistent_store() {
        let store = store();
        match execute_command(AdminCommand::Verify, &store) {
            AdminResponse::Faults { faults } => assert!(faults.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(matches!(
            execute_command(AdminCommand::Repair, &store),
            AdminResponse::Ok { .. }
        ));
    }

    #[test]
    fn response_wire_format() {
        let json = serde_json::to_value(AdminResponse::Pong).unwrap();
        assert_eq!(json, serde_json::json!({"status": "pong"}));
    }
}
