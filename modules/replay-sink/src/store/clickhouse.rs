//! ClickHouse-backed event store.
//!
//! # Schema
//!
//! One MergeTree table, partitioned by month of `ts` and sorted by
//! (project_id, session_id, ts, seq) so a session read is a contiguous range
//! scan. `event_id` and `ingest_ts` are column defaults, filled in by the
//! server on insert. Payloads use a ZSTD codec: replay events are verbose and
//! repetitive, and compress well.
//!
//! Timestamps are `DateTime64(3)`, exchanged with the server as Unix
//! milliseconds.

use super::{EventStore, NewRow, StoreError, StoreResult, StoredRow};
use crate::config::ClickHouseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row shape written on insert; the server assigns the remaining columns.
#[derive(Debug, Clone, Row, Serialize)]
struct InsertRow {
    project_id: u64,
    #[serde(with = "clickhouse::serde::uuid")]
    session_id: Uuid,
    seq: u64,
    ts: i64,
    payload: String,
}

/// Row shape read back for a session.
#[derive(Debug, Clone, Row, Deserialize)]
struct SelectRow {
    project_id: u64,
    #[serde(with = "clickhouse::serde::uuid")]
    session_id: Uuid,
    seq: u64,
    ts: i64,
    payload: String,
    #[serde(with = "clickhouse::serde::uuid")]
    event_id: Uuid,
    ingest_ts: i64,
}

impl From<&NewRow> for InsertRow {
    fn from(row: &NewRow) -> Self {
        Self {
            project_id: row.project_id,
            session_id: row.session_id,
            seq: row.seq,
            ts: row.ts.timestamp_millis(),
            payload: row.payload.clone(),
        }
    }
}

impl TryFrom<SelectRow> for StoredRow {
    type Error = StoreError;

    fn try_from(row: SelectRow) -> Result<Self, Self::Error> {
        Ok(Self {
            project_id: row.project_id,
            session_id: row.session_id,
            seq: row.seq,
            ts: from_millis(row.ts)?,
            payload: row.payload,
            event_id: row.event_id,
            ingest_ts: from_millis(row.ingest_ts)?,
        })
    }
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidValue(format!("timestamp out of range: {}", millis)))
}

/// Event store backed by a ClickHouse MergeTree table
///
/// The client is constructed once and shared by every worker and reader that
/// holds this store.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }

        tracing::info!(
            "ClickHouse store initialized: url={}, database={}, table={}",
            config.url,
            config.database,
            config.table
        );

        Self { client, config }
    }

    /// DDL for the events table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20   project_id UInt64,\n\
             \x20   session_id UUID,\n\
             \x20   seq UInt64,\n\
             \x20   ts DateTime64(3, 'UTC'),\n\
             \x20   payload String CODEC(ZSTD(6)),\n\
             \x20   event_id UUID DEFAULT generateUUIDv4(),\n\
             \x20   ingest_ts DateTime64(3, 'UTC') DEFAULT now64(3)\n\
             )\n\
             ENGINE = MergeTree\n\
             PARTITION BY toYYYYMM(ts)\n\
             ORDER BY (project_id, session_id, ts, seq)\n\
             TTL toDateTime(ts) + INTERVAL {days} DAY",
            table = self.config.table,
            days = self.config.retention_days,
        )
    }

    /// Query reading one session in replay order
    pub fn select_session_sql(&self) -> String {
        format!(
            "SELECT ?fields FROM {} \
             WHERE project_id = ? AND session_id = toUUID(?) \
             ORDER BY ts ASC, seq ASC",
            self.config.table
        )
    }
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        // The configured database may not exist yet, so create it from `default`.
        self.client
            .clone()
            .with_database("default")
            .query(&format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                self.config.database
            ))
            .execute()
            .await?;

        self.client
            .query(&self.create_table_sql())
            .execute()
            .await?;

        tracing::info!(
            database = %self.config.database,
            table = %self.config.table,
            retention_days = self.config.retention_days,
            "ClickHouse schema ready"
        );
        Ok(())
    }

    async fn insert(&self, row: &NewRow) -> StoreResult<()> {
        let mut insert = self.client.insert::<InsertRow>(&self.config.table)?;
        insert.write(&InsertRow::from(row)).await?;
        insert.end().await?;
        Ok(())
    }

    async fn query_session(&self, project_id: u64, session_id: Uuid) -> StoreResult<Vec<StoredRow>> {
        let rows = self
            .client
            .query(&self.select_session_sql())
            .bind(project_id)
            .bind(session_id.to_string())
            .fetch_all::<SelectRow>()
            .await?;

        rows.into_iter().map(StoredRow::try_from).collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        let one: u8 = self.client.query("SELECT 1").fetch_one().await?;
        if one == 1 {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected ping reply {}", one)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> ClickHouseStore {
        ClickHouseStore::new(ClickHouseConfig {
            table: "events_rrweb".to_string(),
            retention_days: 30,
            ..Default::default()
        })
    }

    #[test]
    fn test_create_table_sql() {
        let sql = store().create_table_sql();

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS events_rrweb ("));
        assert!(sql.contains("payload String CODEC(ZSTD(6))"));
        assert!(sql.contains("event_id UUID DEFAULT generateUUIDv4()"));
        assert!(sql.contains("ORDER BY (project_id, session_id, ts, seq)"));
        assert!(sql.contains("PARTITION BY toYYYYMM(ts)"));
        assert!(sql.ends_with("INTERVAL 30 DAY"));
    }

    #[test]
    fn test_select_orders_by_ts_then_seq() {
        let sql = store().select_session_sql();
        assert!(sql.contains("FROM events_rrweb"));
        assert!(sql.ends_with("ORDER BY ts ASC, seq ASC"));
    }

    #[test]
    fn test_insert_row_uses_millisecond_timestamps() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::milliseconds(678);
        let row = NewRow {
            project_id: 1,
            session_id: Uuid::new_v4(),
            seq: 4,
            ts,
            payload: "[]".to_string(),
        };

        let insert = InsertRow::from(&row);
        assert_eq!(insert.ts, ts.timestamp_millis());
        assert_eq!(from_millis(insert.ts).unwrap(), ts);
    }

    #[tokio::test]
    #[ignore] // Requires ClickHouse on localhost:8123
    async fn test_clickhouse_insert_and_query_session() {
        let store = ClickHouseStore::new(ClickHouseConfig {
            database: "replay_test".to_string(),
            ..Default::default()
        });
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        store.ping().await.unwrap();

        let session_id = Uuid::new_v4();
        let base = Utc::now();
        for (seq, offset) in [(1u64, 10i64), (0, 0), (2, 20)] {
            store
                .insert(&NewRow {
                    project_id: 1,
                    session_id,
                    seq,
                    ts: base + chrono::Duration::milliseconds(offset),
                    payload: format!("[{}]", seq),
                })
                .await
                .unwrap();
        }

        let rows = store.query_session(1, session_id).await.unwrap();
        let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(rows.iter().all(|r| !r.event_id.is_nil()));
    }
}
