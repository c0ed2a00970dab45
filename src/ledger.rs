//! Durable record of job lifecycle state.
//!
//! The ledger is the single source of truth for recovery: after a restart the
//! admission controller rebuilds its worklists from [`Ledger::list_by_state`]
//! instead of asking the extraction service what it knows.
//!
//! Every [`Ledger::put`] is all-or-nothing. The SlateDB adapter writes the
//! record and its state index entry in one atomic write batch, so a reader
//! never sees a record listed under a state it is not in.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slatedb::object_store::ObjectStore;
use slatedb::{Db, DbIterator, WriteBatch};
use thiserror::Error;

use crate::job::{JobRecord, JobState};
use crate::keys::{doc_key, end_bound, parse_state_index_key, state_index_key, state_index_prefix};
use crate::settings::LedgerSettings;
use crate::storage::{StorageError, resolve_object_store};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Store `record`, replacing any previous version for its document.
    async fn put(&self, record: &JobRecord) -> Result<(), LedgerError>;

    async fn get(&self, document_id: &str) -> Result<Option<JobRecord>, LedgerError>;

    /// Records currently in `state`, oldest first.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, LedgerError>;
}

fn sort_oldest_first(records: &mut [JobRecord]) {
    records.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
}

/// In-process ledger. Keeps every state each document was written with, which
/// makes lifecycle assertions in tests straightforward.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<BTreeMap<String, JobRecord>>,
    history: Mutex<HashMap<String, Vec<JobState>>>,
    failing_puts: Mutex<u32>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` puts fail without applying anything.
    pub fn fail_next_puts(&self, n: u32) {
        *self.failing_puts.lock().unwrap() = n;
    }

    /// Every state written for a document, in write order, with consecutive
    /// duplicates collapsed.
    pub fn state_history(&self, document_id: &str) -> Vec<JobState> {
        self.history
            .lock()
            .unwrap()
            .get(document_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// A new ledger holding a copy of this one's current records.
    pub fn fork(&self) -> Self {
        let forked = Self::new();
        *forked.records.lock().unwrap() = self.records.lock().unwrap().clone();
        forked
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn put(&self, record: &JobRecord) -> Result<(), LedgerError> {
        {
            let mut failing = self.failing_puts.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(LedgerError::Unavailable("injected put failure".to_string()));
            }
        }
        self.records
            .lock()
            .unwrap()
            .insert(record.document_id.clone(), record.clone());
        let mut history = self.history.lock().unwrap();
        let states = history.entry(record.document_id.clone()).or_default();
        if states.last() != Some(&record.state) {
            states.push(record.state);
        }
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<JobRecord>, LedgerError> {
        Ok(self.records.lock().unwrap().get(document_id).cloned())
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, LedgerError> {
        let mut out: Vec<JobRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }
}

/// SlateDB-backed ledger.
///
/// Layout:
/// - `docs/<document_id>` holds the JSON-encoded [`JobRecord`]
/// - `state/<state>/<document_id>` is an empty index entry per record
pub struct SlateLedger {
    db: Arc<Db>,
    // Serializes read-modify-write of index entries across concurrent puts
    write_lock: tokio::sync::Mutex<()>,
}

impl SlateLedger {
    pub async fn open(settings: &LedgerSettings) -> Result<Self, LedgerError> {
        let resolved = resolve_object_store(&settings.backend, &settings.path)?;
        Self::open_with_store(
            &resolved.canonical_path,
            resolved.store,
            settings.flush_interval_ms.map(Duration::from_millis),
        )
        .await
    }

    pub async fn open_with_store(
        path: &str,
        object_store: Arc<dyn ObjectStore>,
        flush_interval: Option<Duration>,
    ) -> Result<Self, LedgerError> {
        let mut db_builder = slatedb::DbBuilder::new(path, object_store);
        if let Some(flush) = flush_interval {
            let mut settings = slatedb::config::Settings::default();
            settings.flush_interval = Some(flush);
            db_builder = db_builder.with_settings(settings);
        }
        let db = db_builder.build().await?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Close the underlying SlateDB instance gracefully.
    pub async fn close(&self) -> Result<(), LedgerError> {
        self.db.close().await.map_err(LedgerError::from)
    }

    async fn read(&self, document_id: &str) -> Result<Option<JobRecord>, LedgerError> {
        let maybe_raw = self.db.get(doc_key(document_id).as_bytes()).await?;
        match maybe_raw {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Ledger for SlateLedger {
    async fn put(&self, record: &JobRecord) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.read(&record.document_id).await?;
        let value = serde_json::to_vec(record)?;

        let mut batch = WriteBatch::new();
        batch.put(doc_key(&record.document_id).as_bytes(), &value);
        if let Some(prev) = previous.filter(|p| p.state != record.state) {
            batch.delete(state_index_key(prev.state, &record.document_id).as_bytes());
        }
        batch.put(
            state_index_key(record.state, &record.document_id).as_bytes(),
            b"",
        );
        self.db.write(batch).await?;
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<JobRecord>, LedgerError> {
        self.read(document_id).await
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, LedgerError> {
        let prefix = state_index_prefix(state);
        let start = prefix.as_bytes().to_vec();
        let end = end_bound(&prefix);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..end).await?;

        let mut ids = Vec::new();
        while let Some(kv) = iter.next().await? {
            if let Some(id) = parse_state_index_key(state, &kv.key) {
                ids.push(id);
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read(&id).await? {
                Some(record) if record.state == state => out.push(record),
                Some(record) => {
                    tracing::warn!(
                        document_id = %id,
                        indexed = %state,
                        actual = %record.state,
                        "skipping stale state index entry"
                    );
                }
                None => {
                    tracing::warn!(document_id = %id, "state index entry without record");
                }
            }
        }
        sort_oldest_first(&mut out);
        Ok(out)
    }
}
