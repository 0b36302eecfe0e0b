//! Replay session tool
//!
//! Reconstructs one recorded session from the event store and prints it as
//! `{"session_id": ..., "events": [...]}` on stdout, ready to hand to a player.
//!
//! # Usage
//! ```bash
//! CH_URL=http://localhost:8123 ./replay_session \
//!   --project PROJECT_ID \
//!   --session SESSION_UUID
//! ```
//!
//! Logs go to stderr. Malformed rows are skipped and reported there; an
//! unknown session prints an empty event list.
//!
//! Always reads ClickHouse. `STORE_TYPE=inmemory` is rejected: an in-memory
//! store lives inside the sink process and is never visible from here.

use std::env;
use std::sync::Arc;
use uuid::Uuid;

use replay_sink::config::{Config, StoreType};
use replay_sink::store::ClickHouseStore;
use replay_sink::Reconstructor;

/// `--project` and `--session`, both required
struct Args {
    project_id: u64,
    session_id: Uuid,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let args: Vec<String> = env::args().collect();

        if args.len() != 5 {
            return Err(format!(
                "Usage: {} --project PROJECT_ID --session SESSION_UUID",
                args.first().map(|s| s.as_str()).unwrap_or("replay_session")
            ));
        }

        let mut project_id = None;
        let mut session_id = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--project" => {
                    let value = args.get(i + 1).ok_or("--project requires a value")?;
                    project_id = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| format!("Invalid --project: {}", e))?,
                    );
                    i += 2;
                }
                "--session" => {
                    let value = args.get(i + 1).ok_or("--session requires a value")?;
                    session_id = Some(
                        Uuid::parse_str(value).map_err(|e| format!("Invalid --session: {}", e))?,
                    );
                    i += 2;
                }
                _ => return Err(format!("Unknown argument: {}", args[i])),
            }
        }

        Ok(Args {
            project_id: project_id.ok_or("--project is required")?,
            session_id: session_id.ok_or("--session is required")?,
        })
    }
}

/// The store a session is read back from
fn open_store(config: &Config) -> Result<ClickHouseStore, String> {
    match config.store_type {
        StoreType::ClickHouse => Ok(ClickHouseStore::new(config.clickhouse.clone())),
        StoreType::InMemory => Err(
            "STORE_TYPE=inmemory has no rows outside the sink process; point CH_URL at ClickHouse"
                .to_string(),
        ),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let store = match open_store(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    let reconstructor = Reconstructor::new(store);

    let replay = match reconstructor.reconstruct(args.project_id, args.session_id).await {
        Ok(replay) => replay,
        Err(e) => {
            tracing::error!(
                project_id = args.project_id,
                session_id = %args.session_id,
                error = %e,
                "Failed to read session"
            );
            std::process::exit(1);
        }
    };

    if !replay.skipped.is_empty() {
        tracing::warn!(
            rows = replay.rows_read,
            skipped = replay.skipped.len(),
            "Some rows were skipped"
        );
    }

    match serde_json::to_string(&replay.into_response()) {
        Ok(body) => println!("{}", body),
        Err(e) => {
            eprintln!("Error: failed to encode replay: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(store_type: &str) -> Config {
        Config::from_lookup(|key| (key == "STORE_TYPE").then(|| store_type.to_string())).unwrap()
    }

    #[test]
    fn test_open_store_reads_clickhouse() {
        assert!(open_store(&config("clickhouse")).is_ok());
    }

    #[test]
    fn test_open_store_rejects_inmemory() {
        let err = open_store(&config("inmemory")).err().unwrap();
        assert!(err.contains("STORE_TYPE=inmemory"));
    }
}
