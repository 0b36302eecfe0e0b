//! In-memory event store for tests and local runs

use super::{EventStore, NewRow, StoreError, StoreResult, StoredRow};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// EventStore kept in process memory
///
/// Supports failure injection so the sink's redelivery path can be driven
/// deterministically:
/// - [`InMemoryStore::fail_next_inserts`] rejects the next N inserts
/// - [`InMemoryStore::set_available`] makes every operation fail until restored
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    rows: Mutex<Vec<StoredRow>>,
    fail_inserts: AtomicUsize,
    insert_attempts: AtomicUsize,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(Vec::new()),
                fail_inserts: AtomicUsize::new(0),
                insert_attempts: AtomicUsize::new(0),
                available: AtomicBool::new(true),
            }),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StoredRow>> {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject the next `n` inserts with [`StoreError::Unavailable`]
    pub fn fail_next_inserts(&self, n: usize) {
        self.inner.fail_inserts.store(n, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Every stored row, in insertion order
    pub fn rows(&self) -> Vec<StoredRow> {
        self.lock().clone()
    }

    /// Inserts attempted so far, including rejected ones
    pub fn insert_attempts(&self) -> usize {
        self.inner.insert_attempts.load(Ordering::SeqCst)
    }

    /// Append a fully-formed row, bypassing failure injection
    pub fn push_row(&self, row: StoredRow) {
        self.lock().push(row);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn insert(&self, row: &NewRow) -> StoreResult<()> {
        self.inner.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let injected = self
            .inner
            .fail_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }

        self.lock().push(StoredRow {
            project_id: row.project_id,
            session_id: row.session_id,
            seq: row.seq,
            ts: row.ts,
            payload: row.payload.clone(),
            event_id: Uuid::new_v4(),
            ingest_ts: Utc::now(),
        });
        Ok(())
    }

    async fn query_session(&self, project_id: u64, session_id: Uuid) -> StoreResult<Vec<StoredRow>> {
        self.check_available()?;

        let mut rows: Vec<StoredRow> = self
            .lock()
            .iter()
            .filter(|r| r.project_id == project_id && r.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.ts, r.seq));
        Ok(rows)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
