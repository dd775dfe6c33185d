//! tanda-admin CLI tool
//!
//! Inspects pools and the membership index of a running tanda-node.
//!
//! Usage:
//!   tanda-admin ping
//!   tanda-admin list-pools
//!   tanda-admin get-pool <pool_address>
//!   tanda-admin pools-for <participant_address>
//!   tanda-admin verify
//!   tanda-admin repair

use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tanda_ledger::admin_socket::{default_socket_path, AdminCommand};

fn print_usage() {
    eprintln!("tanda-admin - Inspect a tanda-node pool ledger");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tanda-admin ping                      Check if daemon is running");
    eprintln!("  tanda-admin list-pools                List every pool");
    eprintln!("  tanda-admin get-pool <address>        Show one pool");
    eprintln!("  tanda-admin pools-for <address>       List a participant's pools");
    eprintln!("  tanda-admin verify                    Report membership index faults");
    eprintln!("  tanda-admin repair                    Fix membership index faults");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TANDA_ADMIN_SOCKET  Path to admin socket (default: $TANDA_DATA_DIR/admin.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("TANDA_ADMIN_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_socket_path())
}

fn send_command(cmd: AdminCommand) -> Result<Value, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to tanda-node at {:?}: {}\n\
             Is the tanda-node running?",
            socket_path, e
        )
    })?;

    // Send command
    let cmd_json = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    // Read response
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn required_arg(args: &[String], command: &str) -> String {
    match args.get(2) {
        Some(arg) => arg.clone(),
        None => {
            eprintln!("Error: {} requires an address argument", command);
            std::process::exit(1);
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = match args[1].as_str() {
        "ping" => AdminCommand::Ping,
        "list-pools" => AdminCommand::ListPools,
        "get-pool" => AdminCommand::GetPool {
            pool: required_arg(&args, "get-pool"),
        },
        "pools-for" => AdminCommand::PoolsFor {
            participant: required_arg(&args, "pools-for"),
        },
        "verify" => AdminCommand::Verify,
        "repair" => AdminCommand::Repair,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };

    let response = match send_command(cmd) {
        Ok(response) => response,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    match response["status"].as_str() {
        Some("ok") => println!("{}", response["message"].as_str().unwrap_or_default()),
        Some("error") => {
            eprintln!("Error: {}", response["error"].as_str().unwrap_or("unknown error"));
            std::process::exit(1);
        }
        Some("pong") => println!("pong - tanda-node is running"),
        Some("pools") => match response["pools"].as_array() {
            Some(pools) if pools.is_empty() => println!("(none)"),
            Some(pools) => {
                for pool in pools {
                    println!(
                        "{}  {}  ({} participants)",
                        pool["id"].as_str().unwrap_or("?"),
                        pool["name"].as_str().unwrap_or("?"),
                        pool["participants"].as_array().map_or(0, Vec::len)
                    );
                }
            }
            None => print_json(&response),
        },
        Some("pool") => print_json(&response["pool"]),
        Some("faults") => match response["faults"].as_array() {
            Some(faults) if faults.is_empty() => println!("Index consistent"),
            Some(faults) => {
                for fault in faults {
                    println!(
                        "{}: participant {} / pool {}",
                        fault["kind"].as_str().unwrap_or("?"),
                        fault["participant"].as_str().unwrap_or("?"),
                        fault["pool"].as_str().unwrap_or("?")
                    );
                }
                if args[1] == "verify" {
                    std::process::exit(1);
                }
            }
            None => print_json(&response),
        },
        _ => print_json(&response),
    }
}
